use axum::{extract::State, http::header, response::IntoResponse};

use crate::state::AppState;

/// Prometheus metrics endpoint
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(status) = state.pool.status() {
        common::telemetry::record_pool_status(&status);
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
