//! Liveness and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::state::AppState;

/// Liveness endpoint with a short inventory summary.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hosts = state.registry.list().await.len();
    let agents = state.connections.hub().connected_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "hosts": hosts,
        "agents_connected": agents,
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&state).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
