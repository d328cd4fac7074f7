//! HTTP API for health checks and Prometheus metrics

use agent_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::AgentMetrics,
    PassReport,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub node_name: String,
    pub dry_run: bool,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        node_name: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            node_name: node_name.into(),
            dry_run,
        }
    }
}

/// What the agent is watching and what its last cordoned pass did
#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub node: String,
    pub dry_run: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pass_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<PassReport>,
}

/// Liveness - 200 while operational, 503 once a component is unhealthy or the loop stalled
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness - 200 after the first completed pass, 503 otherwise
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Agent status - always 200, for operators inspecting a node's agent
async fn status(State(state): State<Arc<AppState>>) -> Json<AgentStatus> {
    let readiness = state.health_registry.readiness().await;

    Json(AgentStatus {
        node: state.node_name.clone(),
        dry_run: state.dry_run,
        ready: readiness.ready,
        last_pass_timestamp: readiness.last_pass_timestamp,
        last_report: readiness.last_report,
    })
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
