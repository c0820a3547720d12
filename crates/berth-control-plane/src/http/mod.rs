//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Host registration, connection tests and refresh (`/api/hosts`)
//! - Task submission and cancellation (`/api/tasks`)
//! - Pipelines and their webhooks (`/api/pipelines`, `/api/webhook/:token`)
//! - The agent channel (`/api/agent/connect`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use berth_core::protocol::AGENT_CONNECT_PATH;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Hosts
        .route("/api/hosts", post(handlers::create_host).get(handlers::list_hosts))
        .route("/api/hosts/:id", get(handlers::get_host).delete(handlers::delete_host))
        .route("/api/hosts/:id/test", post(handlers::test_connection))
        .route("/api/hosts/:id/refresh", post(handlers::refresh_host))
        // Tasks
        .route("/api/tasks", post(handlers::submit_task).get(handlers::list_tasks))
        .route("/api/tasks/:id", get(handlers::get_task))
        .route("/api/tasks/:id/cancel", post(handlers::cancel_task))
        // Pipelines and webhooks
        .route(
            "/api/pipelines",
            post(handlers::create_pipeline).get(handlers::list_pipelines),
        )
        .route("/api/webhook/:token", post(handlers::receive_webhook))
        // Agent channel
        .route(AGENT_CONNECT_PATH, get(handlers::agent_connect))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
