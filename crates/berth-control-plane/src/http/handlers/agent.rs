//! Agent channel upgrade handler.
//!
//! The agent authenticates before the upgrade: a bearer token whose hash
//! matches the host's stored hash, and the `X-Berth-Host` header naming
//! the host. The hello is checked after the upgrade by the hub.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use berth_core::protocol::AGENT_HOST_HEADER;
use berth_core::{Host, HostId, HostTransportConfig};

use crate::crypto::{constant_time_eq, hash_token};
use crate::http::responses::error_response;
use crate::state::AppState;

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<Host> {
    let token = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();
    let host_ref = headers.get(AGENT_HOST_HEADER)?.to_str().ok()?.trim();

    let host = match state.registry.get(&HostId::new(host_ref)).await {
        Ok(host) => host,
        Err(_) => state.registry.find_agent(host_ref).await?,
    };

    let HostTransportConfig::Agent(endpoint) = &host.transport else {
        return None;
    };
    let presented = hash_token(token);
    if !constant_time_eq(presented.as_bytes(), endpoint.token_hash.as_bytes()) {
        return None;
    }
    Some(host)
}

/// Agent channel endpoint.
pub async fn agent_connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(host) = authenticate(&state, &headers).await else {
        warn!(
            host = headers
                .get(AGENT_HOST_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-"),
            "Agent authentication failed"
        );
        return error_response(StatusCode::UNAUTHORIZED, "agent authentication failed");
    };

    let hub = state.connections.hub().clone();
    let detector = state.detector.clone();
    let hello_timeout = state.config.agent_hello_timeout();
    ws.on_upgrade(move |socket| hub.serve(socket, host, detector, hello_timeout))
        .into_response()
}
