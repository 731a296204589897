//! System and health endpoints.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::state::AppState;
use crate::types::{HealthResponse, QpsStatusResponse};

/// Server status and version.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_secs(),
        quota_enabled: state.quota().is_enabled(),
    })
}

/// Latest harvested QPS report.
pub async fn qps_status(State(state): State<AppState>) -> impl IntoResponse {
    let qps = state.qps();
    Json(QpsStatusResponse {
        interval_ms: qps.interval().as_millis() as u64,
        current_bucket: qps.ring().current_index(),
        last_report: state.last_report(),
    })
}

/// Prometheus-compatible metrics endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.render_metrics(),
    )
}
