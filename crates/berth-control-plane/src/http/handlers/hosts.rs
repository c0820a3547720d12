//! Host registration, inspection and capability handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info};

use berth_core::{Host, HostId, HostSpec};

use crate::detector::DetectError;
use crate::http::responses::{
    error_response, HostListQuery, HostResponse, RegisterHostResponse,
};
use crate::orchestrator::OrchestratorError;
use crate::registry::RegistryError;
use crate::state::AppState;

async fn host_response(state: &AppState, host: &Host) -> HostResponse {
    let reachability = state.connections.reachability().get(&host.id).await;
    let agent = state.connections.hub().session_info(&host.id).await;
    HostResponse::new(host, reachability, agent)
}

fn registry_error(e: RegistryError) -> Response {
    match e {
        RegistryError::NotFound(_) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        RegistryError::Conflict(_) => error_response(StatusCode::CONFLICT, e.to_string()),
        RegistryError::Invalid(_) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        RegistryError::Store(_) => {
            error!(error = %e, "Host store failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn detect_error(e: DetectError) -> Response {
    match e {
        DetectError::Registry(e) => registry_error(e),
        DetectError::WrongKind(_) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        DetectError::Unreachable(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Register a host.
pub async fn create_host(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<HostSpec>,
) -> Response {
    match state.registry.create(spec).await {
        Ok(registered) => {
            let host = host_response(&state, &registered.host).await;
            (
                StatusCode::CREATED,
                Json(RegisterHostResponse {
                    host,
                    agent_token: registered.agent_token,
                }),
            )
                .into_response()
        }
        Err(e) => registry_error(e),
    }
}

/// List hosts, optionally of one kind.
pub async fn list_hosts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HostListQuery>,
) -> Response {
    let hosts = match query.kind {
        Some(kind) => state.registry.list_by_kind(kind).await,
        None => state.registry.list().await,
    };

    let mut response = Vec::with_capacity(hosts.len());
    for host in &hosts {
        response.push(host_response(&state, host).await);
    }
    Json(response).into_response()
}

/// One host.
pub async fn get_host(State(state): State<Arc<AppState>>, Path(id): Path<HostId>) -> Response {
    match state.registry.get(&id).await {
        Ok(host) => Json(host_response(&state, &host).await).into_response(),
        Err(e) => registry_error(e),
    }
}

/// Deregister a host, cancelling its unfinished tasks first.
pub async fn delete_host(State(state): State<Arc<AppState>>, Path(id): Path<HostId>) -> Response {
    match state.orchestrator.deregister_host(&id).await {
        Ok(host) => {
            state.connections.hub().disconnect(&host.id).await;
            state.connections.reachability().forget(&host.id).await;
            state.detector.forget(&host.id);
            info!(host_id = %host.id, "Host removed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(OrchestratorError::Registry(e)) => registry_error(e),
        Err(e) => {
            error!(host_id = %id, error = %e, "Failed to deregister host");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Connection test of an SSH or Portainer host.
pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<HostId>,
) -> Response {
    match state.detector.connection_test(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => detect_error(e),
    }
}

/// Manual capability refresh of any host.
pub async fn refresh_host(State(state): State<Arc<AppState>>, Path(id): Path<HostId>) -> Response {
    match state.detector.refresh(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => detect_error(e),
    }
}
