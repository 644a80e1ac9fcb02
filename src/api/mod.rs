use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    BatchResult, GoalSolveConfig, GoalSolveResult, Outlook, SimulationConfig, run_seeded_batch,
    solve_contribution_for_success_rate,
};

const MIN_CURRENT_AGE: u32 = 18;
const MAX_AGE: u32 = 90;
const MAX_INFLATION_RATE: f64 = 20.0;
const MIN_SOCIAL_SECURITY_AGE: u32 = 62;
const MAX_SOCIAL_SECURITY_AGE: u32 = 70;

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Monte Carlo retirement outlook (savings phase + 30-year retirement)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one simulation batch and print the summary as JSON
    Simulate(SimulateArgs),
    /// Serve the simulation JSON API over HTTP
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 30)]
    current_age: u32,
    #[arg(long, default_value_t = 65)]
    retirement_age: u32,
    #[arg(long, default_value_t = 50_000.0)]
    current_savings: f64,
    #[arg(long, default_value_t = 1_000.0)]
    monthly_contribution: f64,
    #[arg(
        long,
        default_value_t = 5_000.0,
        help = "Monthly expenses while working, netted against contributions"
    )]
    monthly_expenses: f64,
    #[arg(
        long,
        default_value_t = 5_000.0,
        help = "Monthly expenses for the first 20 years of retirement (today's money)"
    )]
    early_retirement_expenses: f64,
    #[arg(
        long,
        default_value_t = 5_000.0,
        help = "Monthly expenses after the first 20 years of retirement (today's money)"
    )]
    late_retirement_expenses: f64,
    #[arg(long, default_value_t = 3.0, help = "Annual inflation in percent")]
    inflation_rate: f64,
    #[arg(
        long,
        default_value_t = 25.0,
        help = "Tax on investment growth before retirement in percent"
    )]
    tax_rate: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Tax on investment gains during retirement in percent"
    )]
    retirement_tax_rate: f64,
    #[arg(
        long,
        default_value_t = 2_000.0,
        help = "Monthly Social Security benefit (today's money)"
    )]
    social_security_benefit: f64,
    #[arg(long, default_value_t = 65)]
    social_security_start_age: u32,
    #[arg(
        long = "expected-return",
        value_delimiter = ',',
        allow_negative_numbers = true,
        default_values_t = [5.0, 7.0, 10.0],
        help = "Annual return candidates in percent, drawn with equal probability each year"
    )]
    expected_returns: Vec<f64>,
    #[arg(long, default_value_t = 1_000)]
    simulations: u32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(
        long,
        help = "Also solve for the monthly contribution reaching this success rate in percent"
    )]
    target_success_rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExpectedReturnsField {
    List(Vec<f64>),
    Csv(String),
}

impl ExpectedReturnsField {
    fn into_rates(self) -> Result<Vec<f64>, String> {
        match self {
            ExpectedReturnsField::List(rates) => Ok(rates),
            ExpectedReturnsField::Csv(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<f64>()
                        .map_err(|_| format!("expectedReturns contains an invalid number: {s}"))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    current_age: Option<u32>,
    retirement_age: Option<u32>,
    current_savings: Option<f64>,
    monthly_contribution: Option<f64>,
    monthly_expenses: Option<f64>,
    early_retirement_expenses: Option<f64>,
    late_retirement_expenses: Option<f64>,
    inflation_rate: Option<f64>,
    tax_rate: Option<f64>,
    retirement_tax_rate: Option<f64>,
    social_security_benefit: Option<f64>,
    social_security_start_age: Option<u32>,
    expected_returns: Option<ExpectedReturnsField>,
    #[serde(alias = "simulations")]
    simulation_runs: Option<u32>,
    seed: Option<u64>,
    target_success_rate: Option<f64>,
}

#[derive(Debug)]
pub struct ApiRequest {
    config: SimulationConfig,
    goal: Option<GoalSolveConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutlookResponse {
    kind: Outlook,
    title: &'static str,
    message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    #[serde(flatten)]
    result: BatchResult,
    seed: u64,
    outlook: OutlookResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    goal: Option<GoalSolveResult>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn build_request(args: SimulateArgs) -> Result<ApiRequest, String> {
    for (name, value) in [
        ("--current-savings", args.current_savings),
        ("--monthly-contribution", args.monthly_contribution),
        ("--monthly-expenses", args.monthly_expenses),
        ("--early-retirement-expenses", args.early_retirement_expenses),
        ("--late-retirement-expenses", args.late_retirement_expenses),
        ("--inflation-rate", args.inflation_rate),
        ("--tax-rate", args.tax_rate),
        ("--retirement-tax-rate", args.retirement_tax_rate),
        ("--social-security-benefit", args.social_security_benefit),
    ] {
        if !value.is_finite() {
            return Err(format!("{name} must be a finite number"));
        }
    }

    if args.simulations == 0 {
        return Err("--simulations must be > 0".to_string());
    }

    if args.expected_returns.is_empty() {
        return Err("--expected-return must be given at least once".to_string());
    }

    if args
        .expected_returns
        .iter()
        .any(|rate| !rate.is_finite() || *rate <= -100.0)
    {
        return Err("--expected-return values must be finite and > -100".to_string());
    }

    if let Some(target) = args.target_success_rate {
        if !(0.0..=100.0).contains(&target) {
            return Err("--target-success-rate must be between 0 and 100".to_string());
        }
    }

    // Out-of-range form values are pulled back into range rather than rejected.
    let current_age = args.current_age.clamp(MIN_CURRENT_AGE, MAX_AGE);
    let retirement_age = args.retirement_age.clamp(current_age, MAX_AGE);

    let config = SimulationConfig {
        current_age,
        retirement_age,
        current_savings: args.current_savings.max(0.0),
        monthly_contribution: args.monthly_contribution.max(0.0),
        monthly_expenses: args.monthly_expenses.max(0.0),
        early_retirement_expenses: args.early_retirement_expenses.max(0.0),
        late_retirement_expenses: args.late_retirement_expenses.max(0.0),
        inflation_rate: args.inflation_rate.clamp(0.0, MAX_INFLATION_RATE) / 100.0,
        tax_rate: args.tax_rate.clamp(0.0, 100.0) / 100.0,
        retirement_tax_rate: args.retirement_tax_rate.clamp(0.0, 100.0) / 100.0,
        social_security_benefit: args.social_security_benefit.max(0.0),
        social_security_start_age: args
            .social_security_start_age
            .clamp(MIN_SOCIAL_SECURITY_AGE, MAX_SOCIAL_SECURITY_AGE),
        expected_returns: args.expected_returns.iter().map(|r| r / 100.0).collect(),
        simulation_runs: args.simulations,
        seed: args.seed,
    };
    config.validate().map_err(|e| e.to_string())?;

    let goal = args.target_success_rate.map(|target| GoalSolveConfig {
        target_success_rate: target,
        ..GoalSolveConfig::default()
    });

    Ok(ApiRequest { config, goal })
}

pub fn simulate(request: &ApiRequest) -> Result<SimulateResponse, String> {
    let result = run_seeded_batch(&request.config).map_err(|e| e.to_string())?;
    let goal = match request.goal {
        Some(goal) => Some(
            solve_contribution_for_success_rate(&request.config, goal)
                .map_err(|e| e.to_string())?,
        ),
        None => None,
    };
    Ok(build_simulate_response(&request.config, result, goal))
}

/// Runs the `simulate` subcommand and returns the pretty-printed JSON summary.
pub fn run_simulate_command(args: SimulateArgs) -> Result<String, String> {
    let request = build_request(args)?;
    let response = simulate(&request)?;
    serde_json::to_string_pretty(&response).map_err(|e| format!("failed to serialize result: {e}"))
}

fn build_simulate_response(
    config: &SimulationConfig,
    result: BatchResult,
    goal: Option<GoalSolveResult>,
) -> SimulateResponse {
    let outlook = Outlook::from_success_rate(result.success_rate);
    SimulateResponse {
        result,
        seed: config.seed,
        outlook: OutlookResponse {
            kind: outlook,
            title: outlook.title(),
            message: outlook.message(),
        },
        goal,
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "retirement simulation API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => {
            warn!(error = %msg, "rejected simulate request");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };

    match tokio::task::spawn_blocking(move || simulate(&request)).await {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("simulation task failed: {e}"),
        ),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.current_age {
        args.current_age = v;
    }
    if let Some(v) = payload.retirement_age {
        args.retirement_age = v;
    }
    if let Some(v) = payload.current_savings {
        args.current_savings = v;
    }
    if let Some(v) = payload.monthly_contribution {
        args.monthly_contribution = v;
    }
    if let Some(v) = payload.monthly_expenses {
        args.monthly_expenses = v;
    }
    if let Some(v) = payload.early_retirement_expenses {
        args.early_retirement_expenses = v;
    }
    if let Some(v) = payload.late_retirement_expenses {
        args.late_retirement_expenses = v;
    }
    if let Some(v) = payload.inflation_rate {
        args.inflation_rate = v;
    }
    if let Some(v) = payload.tax_rate {
        args.tax_rate = v;
    }
    if let Some(v) = payload.retirement_tax_rate {
        args.retirement_tax_rate = v;
    }
    if let Some(v) = payload.social_security_benefit {
        args.social_security_benefit = v;
    }
    if let Some(v) = payload.social_security_start_age {
        args.social_security_start_age = v;
    }
    if let Some(v) = payload.expected_returns {
        args.expected_returns = v.into_rates()?;
    }
    if let Some(v) = payload.simulation_runs {
        args.simulations = v;
    }
    if let Some(v) = payload.seed {
        args.seed = v;
    }
    if let Some(v) = payload.target_success_rate {
        args.target_success_rate = Some(v);
    }

    build_request(args)
}

fn default_args_for_api() -> SimulateArgs {
    SimulateArgs {
        current_age: 30,
        retirement_age: 65,
        current_savings: 50_000.0,
        monthly_contribution: 1_000.0,
        monthly_expenses: 5_000.0,
        early_retirement_expenses: 5_000.0,
        late_retirement_expenses: 5_000.0,
        inflation_rate: 3.0,
        tax_rate: 25.0,
        retirement_tax_rate: 15.0,
        social_security_benefit: 2_000.0,
        social_security_start_age: 65,
        expected_returns: vec![5.0, 7.0, 10.0],
        simulations: 1_000,
        seed: 42,
        target_success_rate: None,
    }
}
