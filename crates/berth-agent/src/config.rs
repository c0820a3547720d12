//! Agent configuration.

use std::time::Duration;

use berth_core::protocol::AGENT_CONNECT_PATH;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane base URL (`http://`, `https://`, `ws://` or `wss://`).
    pub control_plane_url: String,

    /// Host id (or name) this agent connects as.
    pub host_id: String,

    /// Identity announced in the hello; must match the registration.
    pub agent_id: String,

    /// Plaintext agent token issued at registration.
    pub token: String,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Reconnection delay on connection loss (seconds).
    pub reconnect_delay_secs: u64,

    /// Shell used to run task scripts.
    pub shell: String,

    /// Deadline for each local capability check (seconds).
    pub detect_timeout_secs: u64,
}

impl Config {
    /// WebSocket URL of the agent channel.
    pub fn connect_url(&self) -> String {
        let base = self.control_plane_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}{AGENT_CONNECT_PATH}")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_plane_url: "ws://127.0.0.1:8080".to_string(),
            host_id: String::new(),
            agent_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "berth-agent".to_string()),
            token: String::new(),
            heartbeat_interval_secs: 15,
            reconnect_delay_secs: 5,
            shell: "/bin/sh".to_string(),
            detect_timeout_secs: 5,
        }
    }
}
