//! Control plane configuration.

use std::time::Duration;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address (API, webhooks, agent channel).
    pub http_addr: String,

    /// Simultaneous operations allowed per host.
    pub per_host_concurrency: usize,

    /// Non-terminal tasks allowed per host before submissions are refused.
    pub max_queued_per_host: usize,

    /// Deadline for each individual capability check (seconds).
    pub probe_timeout_secs: u64,

    /// How long a cancelled task may take to stop its transport (seconds).
    pub cancel_grace_secs: u64,

    /// Deadline for an agent's hello after the upgrade (seconds).
    pub agent_hello_timeout_secs: u64,

    /// Upper bound for one SSH task execution (seconds).
    pub ssh_command_timeout_secs: u64,

    /// Request timeout for Portainer API calls (seconds).
    pub portainer_timeout_secs: u64,
}

impl Config {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn agent_hello_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_hello_timeout_secs)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_secs)
    }

    pub fn portainer_timeout(&self) -> Duration {
        Duration::from_secs(self.portainer_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            per_host_concurrency: 1,
            max_queued_per_host: 64,
            probe_timeout_secs: 5,
            cancel_grace_secs: 10,
            agent_hello_timeout_secs: 10,
            ssh_command_timeout_secs: 3600,
            portainer_timeout_secs: 120,
        }
    }
}
