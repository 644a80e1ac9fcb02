use serde::Serialize;
use thiserror::Error;

/// Length of the decumulation phase in years.
pub const YEARS_IN_RETIREMENT: u32 = 30;

/// Retirement years up to and including this one use the early expense tier.
pub const YEARS_IN_EARLY_RETIREMENT: u32 = 20;

/// Inputs for one batch of trials. Rates are decimals (`0.02` is 2%).
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub current_age: u32,
    pub retirement_age: u32,
    pub current_savings: f64,
    pub monthly_contribution: f64,
    pub monthly_expenses: f64,
    pub early_retirement_expenses: f64,
    pub late_retirement_expenses: f64,
    pub inflation_rate: f64,
    pub tax_rate: f64,
    pub retirement_tax_rate: f64,
    pub social_security_benefit: f64,
    pub social_security_start_age: u32,
    pub expected_returns: Vec<f64>,
    pub simulation_runs: u32,
    pub seed: u64,
}

impl SimulationConfig {
    pub fn years_to_retirement(&self) -> u32 {
        self.retirement_age.saturating_sub(self.current_age)
    }

    /// Arithmetic mean of the return candidates, 0 when there are none.
    pub fn average_return(&self) -> f64 {
        if self.expected_returns.is_empty() {
            return 0.0;
        }
        self.expected_returns.iter().sum::<f64>() / self.expected_returns.len() as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation_runs == 0 {
            return Err(ConfigError::NoSimulationRuns);
        }
        if self.expected_returns.is_empty() {
            return Err(ConfigError::EmptyExpectedReturns);
        }
        if self.retirement_age < self.current_age {
            return Err(ConfigError::RetirementBeforeCurrentAge {
                current_age: self.current_age,
                retirement_age: self.retirement_age,
            });
        }

        for (field, amount) in [
            ("current_savings", self.current_savings),
            ("monthly_contribution", self.monthly_contribution),
            ("monthly_expenses", self.monthly_expenses),
            ("early_retirement_expenses", self.early_retirement_expenses),
            ("late_retirement_expenses", self.late_retirement_expenses),
            ("social_security_benefit", self.social_security_benefit),
        ] {
            if !amount.is_finite() || amount < 0.0 {
                return Err(ConfigError::NegativeAmount { field });
            }
        }

        for (field, rate) in [
            ("tax_rate", self.tax_rate),
            ("retirement_tax_rate", self.retirement_tax_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::RateOutOfRange { field, value: rate });
            }
        }
        if !self.inflation_rate.is_finite() || self.inflation_rate <= -1.0 {
            return Err(ConfigError::RateOutOfRange {
                field: "inflation_rate",
                value: self.inflation_rate,
            });
        }

        for (index, &value) in self.expected_returns.iter().enumerate() {
            if !value.is_finite() || value <= -1.0 {
                return Err(ConfigError::InvalidReturn { index, value });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("simulation_runs must be > 0")]
    NoSimulationRuns,
    #[error("expected_returns must contain at least one rate")]
    EmptyExpectedReturns,
    #[error("retirement_age ({retirement_age}) must be >= current_age ({current_age})")]
    RetirementBeforeCurrentAge { current_age: u32, retirement_age: u32 },
    #[error("{field} must be a finite amount >= 0")]
    NegativeAmount { field: &'static str },
    #[error("{field} is out of range: {value}")]
    RateOutOfRange { field: &'static str, value: f64 },
    #[error("expected_returns[{index}] must be finite and > -100%, got {value}")]
    InvalidReturn { index: usize, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    #[error("invalid simulation config: {0}")]
    Config(#[from] ConfigError),
    #[error("batch aborted after {completed} of {requested} trials")]
    Aborted { completed: u32, requested: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialOutcome {
    Success { terminal_savings: f64 },
    /// Savings went negative in this (1-based) retirement year.
    Depleted { year: u32 },
}

impl TrialOutcome {
    pub fn terminal_savings(self) -> Option<f64> {
        match self {
            TrialOutcome::Success { terminal_savings } => Some(terminal_savings),
            TrialOutcome::Depleted { .. } => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TrialOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub median_total_needed: f64,
    pub median_projected_savings: f64,
    pub median_gap: f64,
    pub success_rate: f64,
    pub median_adjusted_monthly: f64,
    pub success_count: u32,
    pub simulation_runs: u32,
    pub years_to_retirement: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outlook {
    Exceptional,
    OnTrack,
    MinorAdjustments,
    ActionRequired,
}

impl Outlook {
    pub fn from_success_rate(success_rate: f64) -> Self {
        if success_rate >= 80.0 {
            Outlook::Exceptional
        } else if success_rate >= 50.0 {
            Outlook::OnTrack
        } else if success_rate >= 20.0 {
            Outlook::MinorAdjustments
        } else {
            Outlook::ActionRequired
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Outlook::Exceptional => "Exceptional Outlook!",
            Outlook::OnTrack => "On Track",
            Outlook::MinorAdjustments => "Minor Adjustments Needed",
            Outlook::ActionRequired => "Action Required",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Outlook::Exceptional => {
                "You're well ahead of your retirement goals. Consider exploring legacy planning or charitable giving options."
            }
            Outlook::OnTrack => {
                "You're meeting your retirement goals. Stay consistent with your savings."
            }
            Outlook::MinorAdjustments => {
                "You're close to your goals. Small increases in savings can help bridge the gap."
            }
            Outlook::ActionRequired => {
                "Consider increasing your savings rate or adjusting your retirement expectations."
            }
        }
    }
}
