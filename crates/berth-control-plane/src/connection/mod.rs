//! Connection management for hosts.
//!
//! Every host kind is reached through a [`HostTransport`]. Agent hosts use
//! the long-lived channel held by [`AgentHub`], SSH hosts open a fresh
//! session per operation, and Portainer hosts share one HTTP client.
//! [`ConnectionManager`] resolves a host record to its transport and keeps
//! the per-host reachability table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use berth_core::{
    ComposeSupport, DeployMode, DockerInfo, Host, HostId, HostTransportConfig, LogStream, SwarmMode,
    Task,
};

use crate::config::Config;
use crate::detector::ProbeError;

pub mod agent;
pub mod portainer;
pub mod ssh;

pub use agent::{AgentHub, AgentTransport};
pub use portainer::PortainerTransport;
pub use ssh::SshTransport;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// One line of output from a running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            stream: LogStream::System,
            content: content.into(),
        }
    }
}

/// Ordered output sink handed to [`HostTransport::execute`].
pub type LogSink = mpsc::Sender<LogLine>;

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit status, when the transport has one (Portainer does not).
    pub exit_code: Option<i32>,
}

impl ExecOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code.map_or(true, |c| c == 0)
    }
}

/// Raw per-check results of one probe.
///
/// A failed check only degrades its own field; the detector turns this
/// into a snapshot.
#[derive(Debug)]
pub struct ProbeReport {
    pub compose: Result<ComposeSupport, ProbeError>,
    pub swarm_mode: Result<SwarmMode, ProbeError>,
}

impl ProbeReport {
    /// Report built from a self-reported `docker_info`.
    pub fn from_docker_info(info: &DockerInfo) -> Self {
        let compose = if info.compose_supported {
            ComposeSupport::Available {
                version: info.compose_version.clone(),
            }
        } else {
            ComposeSupport::Unavailable
        };
        Self {
            compose: Ok(compose),
            swarm_mode: Ok(info.swarm_mode),
        }
    }
}

const HEREDOC_MARKER: &str = "BERTH_COMPOSE_EOF";

/// Quote a value for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A heredoc terminator that no line of `body` can end early.
fn heredoc_marker(body: &str) -> String {
    let mut marker = HEREDOC_MARKER.to_string();
    let mut n = 0;
    while body.lines().any(|line| line == marker) {
        n += 1;
        marker = format!("{HEREDOC_MARKER}_{n}");
    }
    marker
}

/// Shell script for hosts that run commands (agent and SSH).
///
/// An explicit script wins. A deploy task that only carries a compose file
/// is turned into the matching `docker compose` or `docker stack` command
/// with the file fed on stdin.
pub fn shell_script(task: &Task) -> Option<String> {
    let script = task.payload.script.trim();
    if !script.is_empty() {
        return Some(task.payload.script.clone());
    }

    let compose_file = task.payload.compose_file.as_deref()?.trim_end();
    let stack = shell_quote(&stack_name(task));
    let command = match task.requested_mode? {
        DeployMode::DockerCompose => format!("docker compose -p {stack} -f - up -d --remove-orphans"),
        DeployMode::DockerStack => format!("docker stack deploy --prune -c - {stack}"),
    };
    let marker = heredoc_marker(compose_file);
    Some(format!("{command} <<'{marker}'\n{compose_file}\n{marker}\n"))
}

/// Stack/project name for a deploy task.
pub fn stack_name(task: &Task) -> String {
    task.payload
        .stack_name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| {
            let short: String = task.id.as_str().chars().take(8).collect();
            format!("berth-{short}")
        })
}

/// A way of reaching one host.
#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Run the capability checks.
    ///
    /// Only a wholly unreachable host is an error.
    async fn probe(&self) -> Result<ProbeReport, TransportError>;

    /// Run a task's operation, streaming output into `log`.
    ///
    /// Implementations stop promptly once `cancel` fires.
    async fn execute(
        &self,
        task: &Task,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, TransportError>;
}

/// Resolves a host record to its transport.
pub trait TransportProvider: Send + Sync {
    fn transport_for(&self, host: &Host) -> Arc<dyn HostTransport>;
}

/// Whether a host answered its last contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
    Connected,
    Unreachable,
}

/// Per-host liveness as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reachability {
    pub state: ReachabilityState,
    pub since: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Reachability of every host that has been contacted at least once.
#[derive(Default)]
pub struct ReachabilityTable {
    entries: RwLock<HashMap<HostId, Reachability>>,
}

impl ReachabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_connected(&self, host_id: &HostId) {
        self.set_state(host_id, ReachabilityState::Connected).await;
    }

    pub async fn mark_unreachable(&self, host_id: &HostId) {
        self.set_state(host_id, ReachabilityState::Unreachable).await;
    }

    async fn set_state(&self, host_id: &HostId, state: ReachabilityState) {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let entry = entries.entry(host_id.clone()).or_insert(Reachability {
            state,
            since: now,
            last_heartbeat: None,
        });
        if entry.state != state {
            entry.state = state;
            entry.since = now;
        }
    }

    pub async fn record_heartbeat(&self, host_id: &HostId) {
        if let Some(entry) = self.entries.write().await.get_mut(host_id) {
            entry.last_heartbeat = Some(Utc::now());
        }
    }

    pub async fn get(&self, host_id: &HostId) -> Option<Reachability> {
        self.entries.read().await.get(host_id).cloned()
    }

    pub async fn forget(&self, host_id: &HostId) {
        self.entries.write().await.remove(host_id);
    }

    pub async fn snapshot(&self) -> HashMap<HostId, Reachability> {
        self.entries.read().await.clone()
    }
}

/// Resolves hosts to transports.
pub struct ConnectionManager {
    hub: Arc<AgentHub>,
    reachability: Arc<ReachabilityTable>,
    portainer_client: reqwest::Client,
    probe_timeout: std::time::Duration,
    ssh_command_timeout: std::time::Duration,
}

impl ConnectionManager {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let reachability = Arc::new(ReachabilityTable::new());
        let portainer_client = reqwest::Client::builder()
            .timeout(config.portainer_timeout())
            .build()?;

        Ok(Self {
            hub: Arc::new(AgentHub::new(reachability.clone())),
            reachability,
            portainer_client,
            probe_timeout: config.probe_timeout(),
            ssh_command_timeout: config.ssh_command_timeout(),
        })
    }

    pub fn hub(&self) -> &Arc<AgentHub> {
        &self.hub
    }

    pub fn reachability(&self) -> &Arc<ReachabilityTable> {
        &self.reachability
    }
}

impl TransportProvider for ConnectionManager {
    fn transport_for(&self, host: &Host) -> Arc<dyn HostTransport> {
        match &host.transport {
            HostTransportConfig::Agent(_) => Arc::new(AgentTransport::new(
                self.hub.clone(),
                host.id.clone(),
                self.probe_timeout,
            )),
            HostTransportConfig::Ssh(endpoint) => Arc::new(SshTransport::new(
                endpoint.clone(),
                self.probe_timeout,
                self.ssh_command_timeout,
            )),
            HostTransportConfig::Portainer(endpoint) => Arc::new(PortainerTransport::new(
                self.portainer_client.clone(),
                endpoint.clone(),
            )),
        }
    }
}
