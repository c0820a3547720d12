//! Host records and their transport configuration.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CapabilitySnapshot, CoreError, HostId};

/// How the control plane reaches a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// Push-style: a companion agent holds a long-lived channel open.
    Agent,
    /// Pull-style: on-demand SSH sessions.
    Ssh,
    /// Managed through a Portainer endpoint.
    Portainer,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Ssh => "ssh",
            Self::Portainer => "portainer",
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent channel credentials.
///
/// Only the SHA-256 hash of the agent token is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    /// Agent id the hello frame must announce.
    pub identity: String,
    /// SHA-256 hash of the agent token (hex encoded).
    pub token_hash: String,
}

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    Password {
        password: String,
    },
    PrivateKey {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

fn default_ssh_port() -> u16 {
    22
}

/// SSH target address and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Accept and learn unknown host keys.
    #[serde(default)]
    pub trust_on_first_use: bool,
    /// Alternate known_hosts file; defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

/// Portainer endpoint and API credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortainerEndpoint {
    /// Base URL of the Portainer instance (e.g. `https://portainer.example.com`).
    pub url: String,
    /// Portainer API access token, sent as `X-API-Key`.
    pub api_token: String,
    /// Portainer environment (endpoint) id.
    pub endpoint_id: u64,
}

impl PortainerEndpoint {
    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Transport configuration, one variant per host kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostTransportConfig {
    Agent(AgentEndpoint),
    Ssh(SshEndpoint),
    Portainer(PortainerEndpoint),
}

impl HostTransportConfig {
    pub fn kind(&self) -> HostKind {
        match self {
            Self::Agent(_) => HostKind::Agent,
            Self::Ssh(_) => HostKind::Ssh,
            Self::Portainer(_) => HostKind::Portainer,
        }
    }
}

/// A managed deployment target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Unique host identifier.
    pub id: HostId,

    /// Operator-facing label.
    pub name: String,

    /// How to reach the host.
    pub transport: HostTransportConfig,

    /// Most recent capability snapshot; `None` until first probed.
    pub capabilities: Option<CapabilitySnapshot>,

    /// When the host was registered.
    pub created_at: DateTime<Utc>,
}

impl Host {
    /// Create a new, never-probed Host.
    pub fn new(name: impl Into<String>, transport: HostTransportConfig) -> Self {
        Self {
            id: HostId::generate(),
            name: name.into(),
            transport,
            capabilities: None,
            created_at: Utc::now(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: HostId) -> Self {
        self.id = id;
        self
    }

    pub fn kind(&self) -> HostKind {
        self.transport.kind()
    }
}

/// Transport part of a registration request.
///
/// Agent hosts only name their identity; the token is generated at
/// registration and handed back once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSpec {
    Agent {
        #[serde(default)]
        identity: Option<String>,
    },
    Ssh(SshEndpoint),
    Portainer(PortainerEndpoint),
}

/// Registration request for a new Host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
}

impl HostSpec {
    /// Reject specs that could never be connected to.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("host name is required".into()));
        }

        match &self.transport {
            TransportSpec::Agent { identity } => {
                if let Some(identity) = identity {
                    validate_identity(identity)?;
                }
            }
            TransportSpec::Ssh(ssh) => {
                if ssh.address.trim().is_empty() {
                    return Err(CoreError::InvalidInput("ssh address is required".into()));
                }
                if ssh.username.trim().is_empty() {
                    return Err(CoreError::InvalidInput("ssh username is required".into()));
                }
                if ssh.port == 0 {
                    return Err(CoreError::InvalidInput("ssh port must be non-zero".into()));
                }
            }
            TransportSpec::Portainer(portainer) => {
                let url = portainer.url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(CoreError::InvalidInput(format!(
                        "portainer url must start with http:// or https://, got '{}'",
                        portainer.url
                    )));
                }
                if portainer.api_token.is_empty() {
                    return Err(CoreError::InvalidInput("portainer api_token is required".into()));
                }
                if portainer.endpoint_id == 0 {
                    return Err(CoreError::InvalidInput(
                        "portainer endpoint_id must be positive".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Validate an agent identity (alphanumeric, hyphens, underscores, dots).
pub fn validate_identity(identity: &str) -> Result<(), CoreError> {
    if identity.is_empty() {
        return Err(CoreError::InvalidInput("agent identity cannot be empty".into()));
    }

    if !identity
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::InvalidInput(
            "agent identity must contain only alphanumeric characters, hyphens, underscores and dots"
                .into(),
        ));
    }

    Ok(())
}
