//! Task submission, inspection and cancellation handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use berth_core::{TaskId, TaskOrigin, TaskSpec};

use crate::http::responses::{error_response, ErrorResponse, TaskListQuery};
use crate::orchestrator::OrchestratorError;
use crate::state::AppState;

fn orchestrator_error(e: OrchestratorError) -> Response {
    let status = match &e {
        OrchestratorError::Invalid(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::HostNotFound(_) | OrchestratorError::TaskNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::HostBusy { .. } => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::TaskNotCancellable { .. } => StatusCode::CONFLICT,
        OrchestratorError::CapabilityMismatch { task_id, reason } => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse {
                    error: reason.to_string(),
                    task_id: Some(task_id.clone()),
                }),
            )
                .into_response();
        }
        OrchestratorError::Registry(_) | OrchestratorError::Store(_) => {
            error!(error = %e, "Task operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

/// Submit a task.
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<TaskSpec>,
) -> Response {
    let spec = spec.with_origin(TaskOrigin::Api);
    match state.orchestrator.submit(spec).await {
        Ok(task) => (StatusCode::ACCEPTED, Json(task)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// List tasks, optionally for one host.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskListQuery>,
) -> Response {
    Json(state.orchestrator.list_tasks(query.host_id.as_ref()).await).into_response()
}

/// One task with its log.
pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<TaskId>) -> Response {
    match state.orchestrator.get_task(&id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// Cancel a queued or running task.
pub async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<TaskId>) -> Response {
    match state.orchestrator.cancel(&id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => orchestrator_error(e),
    }
}
