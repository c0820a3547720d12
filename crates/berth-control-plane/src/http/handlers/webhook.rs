//! Webhook delivery handler.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::http::responses::{error_response, WebhookAccepted, WebhookIgnored};
use crate::orchestrator::OrchestratorError;
use crate::state::AppState;
use crate::webhook::{WebhookOutcome, WebhookRejection};

/// Receive a Git push delivery for a pipeline.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.webhooks.handle(&token, &headers, &body).await {
        Ok(WebhookOutcome::Accepted { task_id }) => {
            (StatusCode::ACCEPTED, Json(WebhookAccepted { task_id })).into_response()
        }
        Ok(WebhookOutcome::Ignored { reason }) => Json(WebhookIgnored {
            ignored: true,
            reason,
        })
        .into_response(),
        Err(e) => {
            let status = match &e {
                WebhookRejection::NotFound => StatusCode::NOT_FOUND,
                WebhookRejection::Forbidden => StatusCode::FORBIDDEN,
                WebhookRejection::Unauthorized => StatusCode::UNAUTHORIZED,
                WebhookRejection::BadRequest(_) => StatusCode::BAD_REQUEST,
                WebhookRejection::Submit(OrchestratorError::HostBusy { .. }) => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                WebhookRejection::Submit(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(status, e.to_string())
        }
    }
}
