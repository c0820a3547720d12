//! Portainer transport.
//!
//! Talks to the Portainer HTTP API with one shared `reqwest::Client`.
//! Portainer manages stacks, not shells, so only deploy tasks can run
//! here. Compose support cannot be checked through the API and is
//! always reported as `Unknown`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use berth_core::{ComposeSupport, DeployMode, PortainerEndpoint, SwarmMode, Task, TaskCategory};

use super::{stack_name, ExecOutcome, HostTransport, LogLine, LogSink, ProbeReport, TransportError};
use crate::detector::ProbeError;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Deserialize)]
struct DockerInfoResponse {
    #[serde(rename = "Swarm", default)]
    swarm: Option<SwarmInfo>,
}

#[derive(Debug, Deserialize)]
struct SwarmInfo {
    #[serde(rename = "LocalNodeState", default)]
    local_node_state: String,
}

#[derive(Debug, Deserialize)]
struct SwarmInspectResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
struct StackEnv {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateStackRequest {
    name: String,
    stack_file_content: String,
    #[serde(rename = "SwarmID", skip_serializing_if = "Option::is_none")]
    swarm_id: Option<String>,
    env: Vec<StackEnv>,
}

#[derive(Debug, Deserialize)]
struct CreateStackResponse {
    #[serde(rename = "Id", default)]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Transport for Portainer-kind hosts.
pub struct PortainerTransport {
    client: reqwest::Client,
    endpoint: PortainerEndpoint,
}

impl PortainerTransport {
    pub fn new(client: reqwest::Client, endpoint: PortainerEndpoint) -> Self {
        Self { client, endpoint }
    }

    fn docker_url(&self, path: &str) -> String {
        format!(
            "{}/api/endpoints/{}/docker/{path}",
            self.endpoint.base_url(),
            self.endpoint.endpoint_id
        )
    }

    async fn get_docker(&self, path: &str) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .get(self.docker_url(path))
            .header(API_KEY_HEADER, &self.endpoint.api_token)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        check_status(response).await
    }

    async fn swarm_id(&self) -> Result<String, TransportError> {
        let response = self.get_docker("swarm").await?;
        let swarm: SwarmInspectResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Remote(format!("unexpected swarm response: {e}")))?;
        Ok(swarm.id)
    }

    async fn create_stack(
        &self,
        task: &Task,
        mode: DeployMode,
        compose_file: &str,
        log: &LogSink,
    ) -> Result<ExecOutcome, TransportError> {
        let name = stack_name(task);
        let (kind, swarm_id) = match mode {
            DeployMode::DockerCompose => ("standalone", None),
            DeployMode::DockerStack => ("swarm", Some(self.swarm_id().await?)),
        };

        let _ = log
            .send(LogLine::system(format!(
                "Creating {kind} stack '{name}' on Portainer endpoint {}",
                self.endpoint.endpoint_id
            )))
            .await;

        let body = CreateStackRequest {
            name: name.clone(),
            stack_file_content: compose_file.to_string(),
            swarm_id,
            env: task
                .payload
                .env
                .iter()
                .map(|(name, value)| StackEnv {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        };

        let url = format!(
            "{}/api/stacks/create/{kind}/string?endpointId={}",
            self.endpoint.base_url(),
            self.endpoint.endpoint_id
        );
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.endpoint.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let response = check_status(response).await?;

        let created: CreateStackResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Remote(format!("unexpected stack response: {e}")))?;
        let message = match created.id {
            Some(id) => format!("Stack '{name}' created (id {id})"),
            None => format!("Stack '{name}' created"),
        };
        let _ = log.send(LogLine::system(message)).await;

        info!(task_id = %task.id, stack = %name, kind, "Portainer stack created");
        Ok(ExecOutcome { exit_code: None })
    }
}

/// Map non-success statuses to transport errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = response
        .json::<ApiErrorResponse>()
        .await
        .ok()
        .and_then(|e| match (e.message, e.details) {
            (Some(m), Some(d)) => Some(format!("{m}: {d}")),
            (m, d) => m.or(d),
        })
        .unwrap_or_else(|| status.to_string());

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Authentication(detail),
        s if s.is_server_error() => TransportError::Unreachable(detail),
        _ => TransportError::Remote(detail),
    })
}

#[async_trait]
impl HostTransport for PortainerTransport {
    async fn probe(&self) -> Result<ProbeReport, TransportError> {
        let response = self.get_docker("info").await?;

        let swarm_mode = match response.json::<DockerInfoResponse>().await {
            Ok(info) => Ok(info
                .swarm
                .map(|s| SwarmMode::from_local_node_state(&s.local_node_state))
                .unwrap_or(SwarmMode::Unknown)),
            Err(e) => Err(ProbeError::CommandFailed(format!("unexpected docker info response: {e}"))),
        };

        Ok(ProbeReport {
            compose: Ok(ComposeSupport::Unknown),
            swarm_mode,
        })
    }

    async fn execute(
        &self,
        task: &Task,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, TransportError> {
        if task.category != TaskCategory::Deploy {
            return Err(TransportError::Unsupported(format!(
                "{} tasks are not supported over Portainer",
                task.category
            )));
        }
        let mode = task.requested_mode.ok_or_else(|| {
            TransportError::Unsupported("deploy tasks require a deployment mode".into())
        })?;
        let compose_file = task.payload.compose_file.as_deref().ok_or_else(|| {
            TransportError::Unsupported("Portainer deployments need a compose_file".into())
        })?;

        tokio::select! {
            result = self.create_stack(task, mode, compose_file, &log) => result,
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }
}
