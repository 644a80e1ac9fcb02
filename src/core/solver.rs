use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::engine::{net_retirement_expense, run_seeded_batch};
use super::types::{BatchError, SimulationConfig, YEARS_IN_RETIREMENT};

/// Present value of the retirement spending schedule, net of Social Security,
/// discounted year by year at the average of the return candidates.
pub fn present_value_needed(config: &SimulationConfig) -> f64 {
    let discount = 1.0 + config.average_return();
    (1..=YEARS_IN_RETIREMENT)
        .map(|year| net_retirement_expense(config, year) / discount.powi(year as i32))
        .sum()
}

/// Level monthly payment whose future value after `years_to_retirement` years,
/// compounding monthly at `average_return / 12`, covers `shortfall`.
///
/// With no months left the whole shortfall is due now. With a zero rate (or a
/// rate so small the annuity factor degenerates) the shortfall is spread evenly.
pub fn required_monthly_adjustment(
    shortfall: f64,
    average_return: f64,
    years_to_retirement: u32,
) -> f64 {
    if !shortfall.is_finite() || shortfall <= 0.0 {
        return 0.0;
    }

    let months = years_to_retirement * 12;
    if months == 0 {
        return shortfall;
    }

    let even_split = shortfall / months as f64;
    let monthly_return = average_return / 12.0;
    if monthly_return == 0.0 {
        return even_split;
    }

    let annuity_growth = (1.0 + monthly_return).powi(months as i32) - 1.0;
    let payment = shortfall * monthly_return / annuity_growth;
    if payment.is_finite() && payment > 0.0 {
        payment
    } else {
        even_split
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GoalSolveConfig {
    /// Percent, 0-100.
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
}

impl Default for GoalSolveConfig {
    fn default() -> Self {
        Self {
            target_success_rate: 90.0,
            search_min: 0.0,
            search_max: 20_000.0,
            tolerance: 1.0,
            max_iterations: 40,
            simulations_per_iteration: 500,
            final_simulations: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_contribution: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveResult {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub solved_contribution: Option<f64>,
    pub additional_contribution: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<GoalSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GoalSolveError {
    #[error("{0}")]
    InvalidGoal(&'static str),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Bisects the monthly contribution until the seeded success rate reaches the
/// target. Every candidate replays the same trial seeds, so success rate is
/// monotone in the contribution.
pub fn solve_contribution_for_success_rate(
    config: &SimulationConfig,
    goal: GoalSolveConfig,
) -> Result<GoalSolveResult, GoalSolveError> {
    validate_goal(goal)?;
    config.validate().map_err(BatchError::from)?;

    let target = goal.target_success_rate;
    let mut iterations = Vec::with_capacity(goal.max_iterations as usize);
    let low_eval = evaluate_candidate(config, goal.simulations_per_iteration, goal.search_min)?;
    let high_eval = evaluate_candidate(config, goal.simulations_per_iteration, goal.search_max)?;

    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.success_rate + 1e-12 >= target {
        solved_value = Some(goal.search_min);
        converged = true;
        feasible = true;
        message = "Already meets target at lower contribution bound.".to_string();
    } else if high_eval.success_rate + 1e-12 < target {
        feasible = false;
        message = "No feasible contribution found within the search bounds.".to_string();
    } else {
        let mut lo = goal.search_min;
        let mut hi = goal.search_max;
        let mut it = 0;
        while it < goal.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_candidate(config, goal.simulations_per_iteration, mid)?;
            iterations.push(GoalSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_contribution: mid,
                success_rate: eval.success_rate,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if eval.success_rate + 1e-12 >= target {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= goal.tolerance {
                converged = true;
                break;
            }
        }
        solved_value = Some(hi);
        feasible = true;
        message = if converged {
            "Solved required monthly contribution.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let mut achieved_success_rate = None;
    let mut achieved_success_ci_half_width = None;
    if let Some(value) = solved_value {
        let final_eval = evaluate_candidate(config, goal.final_simulations, value)?;
        achieved_success_rate = Some(final_eval.success_rate);
        achieved_success_ci_half_width = Some(final_eval.success_ci_half_width);
    }

    info!(
        target_success_rate = target,
        feasible,
        converged,
        solved_contribution = ?solved_value,
        iterations = iterations.len(),
        "contribution goal solve finished"
    );

    Ok(GoalSolveResult {
        target_success_rate: target,
        search_min: goal.search_min,
        search_max: goal.search_max,
        solved_contribution: solved_value,
        additional_contribution: solved_value.map(|v| (v - config.monthly_contribution).max(0.0)),
        achieved_success_rate,
        achieved_success_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_rate: f64,
    success_ci_half_width: f64,
}

fn evaluate_candidate(
    base: &SimulationConfig,
    simulations: u32,
    monthly_contribution: f64,
) -> Result<CandidateEval, BatchError> {
    let mut config = base.clone();
    config.simulation_runs = simulations.max(1);
    config.monthly_contribution = monthly_contribution.max(0.0);

    let result = run_seeded_batch(&config)?;
    Ok(CandidateEval {
        success_rate: result.success_rate,
        success_ci_half_width: binomial_ci_half_width(result.success_rate, config.simulation_runs),
    })
}

/// 95% normal-approximation half width, in percentage points.
fn binomial_ci_half_width(success_rate: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = (success_rate / 100.0).clamp(0.0, 1.0);
    100.0 * 1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_goal(goal: GoalSolveConfig) -> Result<(), GoalSolveError> {
    if !(0.0..=100.0).contains(&goal.target_success_rate) {
        return Err(GoalSolveError::InvalidGoal(
            "target_success_rate must be between 0 and 100",
        ));
    }
    if !goal.search_min.is_finite() || !goal.search_max.is_finite() {
        return Err(GoalSolveError::InvalidGoal("search bounds must be finite"));
    }
    if goal.search_min < 0.0 {
        return Err(GoalSolveError::InvalidGoal("search_min must be >= 0"));
    }
    if goal.search_max <= goal.search_min {
        return Err(GoalSolveError::InvalidGoal(
            "search_max must be greater than search_min",
        ));
    }
    if !goal.tolerance.is_finite() || goal.tolerance <= 0.0 {
        return Err(GoalSolveError::InvalidGoal("tolerance must be > 0"));
    }
    if goal.max_iterations == 0 {
        return Err(GoalSolveError::InvalidGoal("max_iterations must be > 0"));
    }
    if goal.simulations_per_iteration == 0 || goal.final_simulations == 0 {
        return Err(GoalSolveError::InvalidGoal("simulation counts must be > 0"));
    }
    Ok(())
}
