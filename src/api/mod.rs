use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::core::{
    Cma, CmaOverride, ClientPortfolio, EngineError, McConfig, McResult, PortfolioDescription,
    ScheduledFlowMode, SolveConfig, SolveResult, run_simulation, solve_required_contribution,
};

/// Body of `POST /simulate`: the declarative portfolio record plus run
/// parameters. Defaults mirror the engine's.
#[derive(Debug, Deserialize)]
struct SimulatePayload {
    portfolio: PortfolioDescription,
    #[serde(default)]
    cma_override: Option<CmaOverride>,
    #[serde(default = "default_n_paths")]
    n_paths: usize,
    #[serde(default = "default_seed")]
    seed: Option<u64>,
    #[serde(default = "default_store_percentiles")]
    store_percentiles: bool,
    #[serde(default)]
    trajectory_sample_cap: Option<usize>,
    #[serde(default)]
    scheduled_flow_mode: Option<ScheduledFlowMode>,
}

fn default_n_paths() -> usize {
    10_000
}

fn default_seed() -> Option<u64> {
    Some(42)
}

fn default_store_percentiles() -> bool {
    true
}

/// Body of `POST /solve`: same portfolio record plus the solver settings.
#[derive(Debug, Deserialize)]
struct SolvePayload {
    portfolio: PortfolioDescription,
    #[serde(default)]
    cma_override: Option<CmaOverride>,
    solve: SolveConfig,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router();

    let listener = TcpListener::bind(addr).await?;
    info!("wealthcast API listening on http://{addr}");

    axum::serve(listener, app).await
}

fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/simulate", post(simulate_handler))
        .route("/solve", post(solve_handler))
        .fallback(not_found_handler)
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(Json(payload): Json<SimulatePayload>) -> Response {
    debug!(n_paths = payload.n_paths, "simulate request");
    match run_from_payload(payload) {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn solve_handler(Json(payload): Json<SolvePayload>) -> Response {
    debug!(goal = %payload.solve.goal_label, "solve request");
    match solve_from_payload(payload) {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn run_from_payload(payload: SimulatePayload) -> Result<McResult, EngineError> {
    let cma = cma_from_override(payload.cma_override.as_ref())?;
    let portfolio = ClientPortfolio::from_description(payload.portfolio);
    let mut config = McConfig {
        n_paths: payload.n_paths,
        seed: payload.seed,
        store_percentiles: payload.store_percentiles,
        ..McConfig::default()
    };
    if let Some(cap) = payload.trajectory_sample_cap {
        config.trajectory_sample_cap = cap;
    }
    if let Some(mode) = payload.scheduled_flow_mode {
        config.scheduled_flow_mode = mode;
    }
    run_simulation(&portfolio, &cma, &config)
}

fn solve_from_payload(payload: SolvePayload) -> Result<SolveResult, EngineError> {
    let cma = cma_from_override(payload.cma_override.as_ref())?;
    let portfolio = ClientPortfolio::from_description(payload.portfolio);
    solve_required_contribution(&portfolio, &cma, &payload.solve)
}

fn cma_from_override(overrides: Option<&CmaOverride>) -> Result<Cma, EngineError> {
    match overrides {
        Some(o) => Cma::with_overrides(o),
        None => Ok(Cma::baseline()),
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
    json_response(status, ErrorResponse { error: msg.to_string() })
}
