//! Host capability snapshots.
//!
//! A snapshot records what a host could do at `detected_at`. It is a
//! fixed structure: each check has its own tagged field, so "not checked"
//! (`Unknown`) never collapses into "checked and negative".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Swarm node state of the target engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmMode {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl SwarmMode {
    /// Map Docker's `Swarm.LocalNodeState` onto the three recorded values.
    ///
    /// `pending`, `error` and `locked` nodes cannot accept stack deploys,
    /// but they are not plainly inactive either, so they map to `Unknown`.
    pub fn from_local_node_state(state: &str) -> Self {
        match state.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SwarmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the Compose plugin check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComposeSupport {
    /// The version command succeeded.
    Available { version: Option<String> },
    /// The version command ran and failed or timed out.
    Unavailable,
    /// The transport cannot check Compose (e.g. Portainer).
    #[default]
    Unknown,
}

impl ComposeSupport {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Available { version } => version.as_deref(),
            _ => None,
        }
    }
}

/// Which of the three allowed triggers produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTrigger {
    /// First hello on a freshly authenticated agent channel.
    AgentHello,
    /// Operator-initiated connection test of an ssh/portainer host.
    ConnectionTest,
    /// Operator-initiated refresh of any host.
    ManualRefresh,
}

/// Cached, timestamped result of the most recent probe for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotRepr")]
pub struct CapabilitySnapshot {
    compose: ComposeSupport,
    swarm_mode: SwarmMode,
    stack_supported: bool,
    detected_at: DateTime<Utc>,
    trigger: ProbeTrigger,
}

#[derive(Deserialize)]
struct SnapshotRepr {
    compose: ComposeSupport,
    swarm_mode: SwarmMode,
    detected_at: DateTime<Utc>,
    trigger: ProbeTrigger,
}

impl From<SnapshotRepr> for CapabilitySnapshot {
    fn from(repr: SnapshotRepr) -> Self {
        Self::at(repr.compose, repr.swarm_mode, repr.trigger, repr.detected_at)
    }
}

impl CapabilitySnapshot {
    /// Build a snapshot stamped with the current time.
    pub fn new(compose: ComposeSupport, swarm_mode: SwarmMode, trigger: ProbeTrigger) -> Self {
        Self::at(compose, swarm_mode, trigger, Utc::now())
    }

    /// Build a snapshot with an explicit detection time.
    pub fn at(
        compose: ComposeSupport,
        swarm_mode: SwarmMode,
        trigger: ProbeTrigger,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            compose,
            swarm_mode,
            stack_supported: swarm_mode == SwarmMode::Active,
            detected_at,
            trigger,
        }
    }

    /// Build a snapshot from an agent-reported `docker_info`.
    ///
    /// The reported `stack_supported` is ignored and re-derived from
    /// `swarm_mode`.
    pub fn from_docker_info(info: &DockerInfo, trigger: ProbeTrigger) -> Self {
        let compose = if info.compose_supported {
            ComposeSupport::Available {
                version: info.compose_version.clone(),
            }
        } else {
            ComposeSupport::Unavailable
        };
        Self::new(compose, info.swarm_mode, trigger)
    }

    pub fn compose(&self) -> &ComposeSupport {
        &self.compose
    }

    pub fn swarm_mode(&self) -> SwarmMode {
        self.swarm_mode
    }

    pub fn stack_supported(&self) -> bool {
        self.stack_supported
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    pub fn trigger(&self) -> ProbeTrigger {
        self.trigger
    }

    /// The persisted `docker_info` form.
    pub fn to_docker_info(&self) -> DockerInfo {
        DockerInfo {
            compose_supported: self.compose.is_available(),
            stack_supported: self.stack_supported,
            compose_version: self.compose.version().map(str::to_owned),
            swarm_mode: self.swarm_mode,
        }
    }

    /// Check whether this snapshot allows a deployment in `mode`.
    ///
    /// Compose `Unknown` is accepted: it means the transport could not
    /// check, not that the check failed.
    pub fn check_mode(&self, mode: DeployMode) -> Result<(), CapabilityGap> {
        match mode {
            DeployMode::DockerCompose => match self.compose {
                ComposeSupport::Unavailable => Err(CapabilityGap::ComposeUnavailable),
                _ => Ok(()),
            },
            DeployMode::DockerStack if self.stack_supported => Ok(()),
            DeployMode::DockerStack => Err(CapabilityGap::SwarmNotActive {
                swarm_mode: self.swarm_mode,
            }),
        }
    }
}

/// Check a possibly-absent snapshot against a requested mode.
pub fn check_deploy_mode(
    snapshot: Option<&CapabilitySnapshot>,
    mode: DeployMode,
) -> Result<(), CapabilityGap> {
    match snapshot {
        Some(snapshot) => snapshot.check_mode(mode),
        None => Err(CapabilityGap::NeverProbed),
    }
}

/// The capability a host lacks for a requested deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "missing", rename_all = "snake_case")]
pub enum CapabilityGap {
    /// No snapshot has ever been recorded for the host.
    NeverProbed,
    /// The Compose version check failed on the host.
    ComposeUnavailable,
    /// The host is not an active Swarm node.
    SwarmNotActive { swarm_mode: SwarmMode },
}

impl fmt::Display for CapabilityGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverProbed => f.write_str(
                "its capabilities have never been detected (run a connection test or refresh first)",
            ),
            Self::ComposeUnavailable => f.write_str("the Docker Compose plugin is not available"),
            Self::SwarmNotActive { swarm_mode } => {
                write!(f, "Swarm mode is {swarm_mode}, stack deployments need an active Swarm node")
            }
        }
    }
}

/// Requested deployment mode for deploy-category tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeployMode {
    #[serde(rename = "docker-compose")]
    DockerCompose,
    #[serde(rename = "docker-stack")]
    DockerStack,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DockerCompose => "docker-compose",
            Self::DockerStack => "docker-stack",
        }
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted capability form, also carried inline in the agent hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInfo {
    pub compose_supported: bool,
    #[serde(default)]
    pub stack_supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_version: Option<String>,
    #[serde(default)]
    pub swarm_mode: SwarmMode,
}
