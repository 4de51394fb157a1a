//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};

use crate::gatekeeper::Rejection;
use crate::sandbox::RunOptions;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RunCodeRequest {
    pub code: String,
    pub user_id: String,
    #[serde(default)]
    pub time_ms: Option<u64>,
    #[serde(default)]
    pub output_bytes: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunCodeResponse {
    pub output: String,
    pub failed: bool,
    pub truncated: bool,
    pub timed_out: bool,
    pub rejection: Option<Rejection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub builtins: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/run_code", post(run_code))
        .route("/capabilities", get(capabilities))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

async fn health() -> &'static str {
    "OK"
}

async fn capabilities(State(state): State<AppState>) -> Json<CapabilitiesResponse> {
    let builtins = state
        .sandbox
        .capability_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    Json(CapabilitiesResponse { builtins })
}

/// Always answers 200: rejections, failures and timeouts are results.
async fn run_code(
    State(state): State<AppState>,
    Json(req): Json<RunCodeRequest>,
) -> Json<RunCodeResponse> {
    let span = info_span!("run_code", user_id = %req.user_id);
    let options = RunOptions {
        time_ms: req.time_ms,
        output_bytes: req.output_bytes,
    };
    let evaluation = state
        .sandbox
        .execute(&req.code, options)
        .instrument(span)
        .await;

    Json(RunCodeResponse {
        output: evaluation.transcript(),
        failed: evaluation.result.failed,
        truncated: evaluation.result.truncated,
        timed_out: evaluation.result.timed_out,
        rejection: evaluation.rejection,
    })
}
