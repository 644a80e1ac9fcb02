mod engine;
mod solver;
mod types;

pub use engine::{derive_seed, run_batch, run_batch_with_abort, run_seeded_batch, run_trial, trial_rng};
pub use solver::{
    GoalSolveConfig, GoalSolveError, GoalSolveIteration, GoalSolveResult, present_value_needed,
    required_monthly_adjustment, solve_contribution_for_success_rate,
};
pub use types::{
    BatchError, BatchResult, ConfigError, Outlook, SimulationConfig, TrialOutcome,
    YEARS_IN_EARLY_RETIREMENT, YEARS_IN_RETIREMENT,
};
