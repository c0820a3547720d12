//! Pipeline handlers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use berth_core::PipelineSpec;

use crate::http::responses::{error_response, PipelineResponse};
use crate::state::AppState;
use crate::webhook::PipelineError;

/// Register a pipeline.
pub async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<PipelineSpec>,
) -> Response {
    match state.webhooks.create_pipeline(spec).await {
        Ok(pipeline) => {
            (StatusCode::CREATED, Json(PipelineResponse::from(pipeline))).into_response()
        }
        Err(e @ PipelineError::Invalid(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ PipelineError::HostNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Failed to register pipeline");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// List pipelines. Secrets are never serialized.
pub async fn list_pipelines(State(state): State<Arc<AppState>>) -> Response {
    let pipelines: Vec<PipelineResponse> = state
        .webhooks
        .list_pipelines()
        .await
        .into_iter()
        .map(PipelineResponse::from)
        .collect();
    Json(pipelines).into_response()
}
