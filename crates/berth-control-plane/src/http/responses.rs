//! HTTP request and response types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use berth_core::{
    CapabilitySnapshot, DockerInfo, Host, HostId, HostKind, HostTransportConfig, Pipeline, TaskId,
};

use crate::connection::agent::AgentSessionInfo;
use crate::connection::Reachability;

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,

    /// Set when a task record was created before the request failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Build an error response with a status code.
pub fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            task_id: None,
        }),
    )
        .into_response()
}

// ============================================================================
// Host types
// ============================================================================

/// Query for the host list.
#[derive(Debug, Deserialize)]
pub struct HostListQuery {
    pub kind: Option<HostKind>,
}

/// Where a host lives, without credentials.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointResponse {
    Agent { identity: String },
    Ssh { address: String, port: u16, username: String },
    Portainer { url: String, endpoint_id: u64 },
}

impl From<&HostTransportConfig> for EndpointResponse {
    fn from(transport: &HostTransportConfig) -> Self {
        match transport {
            HostTransportConfig::Agent(a) => Self::Agent {
                identity: a.identity.clone(),
            },
            HostTransportConfig::Ssh(s) => Self::Ssh {
                address: s.address.clone(),
                port: s.port,
                username: s.username.clone(),
            },
            HostTransportConfig::Portainer(p) => Self::Portainer {
                url: p.url.clone(),
                endpoint_id: p.endpoint_id,
            },
        }
    }
}

/// Response for a single host.
#[derive(Debug, Serialize)]
pub struct HostResponse {
    pub id: HostId,
    pub name: String,
    pub kind: HostKind,
    pub endpoint: EndpointResponse,
    /// Persisted capability form; `null` until first probed.
    pub docker_info: Option<DockerInfo>,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reachability: Option<Reachability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSessionInfo>,
    pub created_at: DateTime<Utc>,
}

impl HostResponse {
    pub fn new(
        host: &Host,
        reachability: Option<Reachability>,
        agent: Option<AgentSessionInfo>,
    ) -> Self {
        Self {
            id: host.id.clone(),
            name: host.name.clone(),
            kind: host.kind(),
            endpoint: EndpointResponse::from(&host.transport),
            docker_info: host.capabilities.as_ref().map(CapabilitySnapshot::to_docker_info),
            capabilities: host.capabilities.clone(),
            reachability,
            agent,
            created_at: host.created_at,
        }
    }
}

/// Response for a registration.
#[derive(Debug, Serialize)]
pub struct RegisterHostResponse {
    pub host: HostResponse,
    /// Plaintext agent token; only returned here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_token: Option<String>,
}

// ============================================================================
// Task types
// ============================================================================

/// Query for the task list.
#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub host_id: Option<HostId>,
}

// ============================================================================
// Pipeline types
// ============================================================================

/// Response for a pipeline registration.
#[derive(Debug, Serialize)]
pub struct PipelineResponse {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub webhook_path: String,
}

impl From<Pipeline> for PipelineResponse {
    fn from(pipeline: Pipeline) -> Self {
        let webhook_path = format!("/api/webhook/{}", pipeline.webhook_token);
        Self {
            pipeline,
            webhook_path,
        }
    }
}

// ============================================================================
// Webhook types
// ============================================================================

/// Response for an accepted delivery.
#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    pub task_id: TaskId,
}

/// Response for an ignored delivery.
#[derive(Debug, Serialize)]
pub struct WebhookIgnored {
    pub ignored: bool,
    pub reason: String,
}
