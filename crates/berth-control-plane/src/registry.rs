//! Host registry.
//!
//! Create, read and delete host records. Capability snapshots can only be
//! written through [`HostRegistry::update_capabilities`], which takes a
//! [`CapabilityWrite`] that only the detector can produce.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use berth_core::host::validate_identity;
use berth_core::{
    AgentEndpoint, CapabilitySnapshot, CoreError, Host, HostId, HostKind, HostSpec,
    HostTransportConfig, TransportSpec,
};

use crate::crypto::generate_token;
use crate::detector::CapabilityWrite;
use crate::store::{HostStore, StoreError, TaskStore};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Host not found: {0}")]
    NotFound(HostId),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<CoreError> for RegistryError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidInput(msg) => Self::Invalid(msg),
            other => Self::Invalid(other.to_string()),
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::HostNotFound(id) => Self::NotFound(id),
            StoreError::Duplicate(what) => Self::Conflict(format!("{what} is taken")),
            other => Self::Store(other),
        }
    }
}

/// A freshly registered host.
///
/// `agent_token` is the plaintext agent credential. It is returned once
/// and never stored.
#[derive(Debug, Clone)]
pub struct RegisteredHost {
    pub host: Host,
    pub agent_token: Option<String>,
}

/// Host records.
pub struct HostRegistry {
    hosts: Arc<dyn HostStore>,
    tasks: Arc<dyn TaskStore>,
}

impl HostRegistry {
    pub fn new(hosts: Arc<dyn HostStore>, tasks: Arc<dyn TaskStore>) -> Self {
        Self { hosts, tasks }
    }

    /// Register a host. Agent hosts get a new token.
    pub async fn create(&self, spec: HostSpec) -> Result<RegisteredHost, RegistryError> {
        spec.validate()?;

        // Name and identity uniqueness is enforced by the store on insert.
        let name = spec.name.trim().to_string();

        let mut agent_token = None;
        let transport = match spec.transport {
            TransportSpec::Agent { identity } => {
                let identity = match identity {
                    Some(identity) => identity,
                    None => default_identity(&name),
                };
                validate_identity(&identity)?;

                let (plaintext, token_hash) = generate_token();
                agent_token = Some(plaintext);
                HostTransportConfig::Agent(AgentEndpoint {
                    identity,
                    token_hash,
                })
            }
            TransportSpec::Ssh(endpoint) => HostTransportConfig::Ssh(endpoint),
            TransportSpec::Portainer(endpoint) => HostTransportConfig::Portainer(endpoint),
        };

        let host = Host::new(name, transport);
        self.hosts.insert_host(host.clone()).await?;

        info!(host_id = %host.id, name = %host.name, kind = %host.kind(), "Host registered");
        Ok(RegisteredHost { host, agent_token })
    }

    pub async fn get(&self, id: &HostId) -> Result<Host, RegistryError> {
        self.hosts
            .get_host(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub async fn list(&self) -> Vec<Host> {
        self.hosts.list_hosts().await
    }

    pub async fn list_by_kind(&self, kind: HostKind) -> Vec<Host> {
        self.hosts
            .list_hosts()
            .await
            .into_iter()
            .filter(|h| h.kind() == kind)
            .collect()
    }

    /// Find the agent host with a given name or id.
    pub async fn find_agent(&self, name_or_id: &str) -> Option<Host> {
        self.hosts
            .list_hosts()
            .await
            .into_iter()
            .filter(|h| h.kind() == HostKind::Agent)
            .find(|h| h.id.as_str() == name_or_id || h.name == name_or_id)
    }

    /// Replace a host's capability snapshot.
    pub async fn update_capabilities(
        &self,
        id: &HostId,
        snapshot: CapabilitySnapshot,
        _write: CapabilityWrite,
    ) -> Result<(), RegistryError> {
        self.hosts.replace_capabilities(id, snapshot).await?;
        Ok(())
    }

    /// Remove a host that has no active tasks.
    ///
    /// Callers that want active tasks cancelled first go through the
    /// orchestrator's `deregister_host`.
    pub async fn delete(&self, id: &HostId) -> Result<Host, RegistryError> {
        let active = self.tasks.active_task_count(id).await;
        if active > 0 {
            return Err(RegistryError::Conflict(format!(
                "host {id} still has {active} active task(s)"
            )));
        }
        let host = self.hosts.remove_host(id).await?;
        info!(host_id = %host.id, name = %host.name, "Host deregistered");
        Ok(host)
    }
}

/// Agent identity derived from a host name: anything outside
/// `[A-Za-z0-9._-]` becomes `-`.
fn default_identity(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
