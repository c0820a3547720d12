//! Berth Agent Daemon

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod connection;
mod detect;
mod executor;

use config::Config;
use connection::AgentConnection;

/// Berth agent: runs tasks dispatched by the control plane on this host.
#[derive(Parser, Debug)]
#[command(name = "berth-agent", version)]
struct Args {
    /// Control plane base URL
    #[arg(long, env = "BERTH_CONTROL_PLANE_URL", default_value = "ws://127.0.0.1:8080")]
    control_plane_url: String,

    /// Host id or name registered on the control plane
    #[arg(long, env = "BERTH_HOST")]
    host: String,

    /// Agent identity announced in the hello (defaults to the host name)
    #[arg(long, env = "BERTH_AGENT_ID")]
    agent_id: Option<String>,

    /// Agent token issued at registration
    #[arg(long, env = "BERTH_AGENT_TOKEN", hide_env_values = true)]
    token: String,

    /// Heartbeat interval, in seconds
    #[arg(long, default_value_t = 15)]
    heartbeat_interval_secs: u64,

    /// Delay before reconnecting, in seconds
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,

    /// Shell used to run task scripts
    #[arg(long, default_value = "/bin/sh")]
    shell: String,

    /// Deadline for each local capability check, in seconds
    #[arg(long, default_value_t = 5)]
    detect_timeout_secs: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            agent_id: args.agent_id.unwrap_or_else(|| args.host.clone()),
            control_plane_url: args.control_plane_url,
            host_id: args.host,
            token: args.token,
            heartbeat_interval_secs: args.heartbeat_interval_secs,
            reconnect_delay_secs: args.reconnect_delay_secs,
            shell: args.shell,
            detect_timeout_secs: args.detect_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("berth_agent=info")),
        )
        .with_target(true)
        .init();

    let config: Arc<Config> = Arc::new(Args::parse().into());

    info!(
        host = %config.host_id,
        agent_id = %config.agent_id,
        control_plane = %config.control_plane_url,
        "Starting Berth agent"
    );

    // Reconnection loop
    loop {
        let mut connection = AgentConnection::new(config.clone());

        match connection.connect_and_run().await {
            Ok(_) => {
                info!("Connection closed");
            }
            Err(e) => {
                error!(error = %e, "Connection error");
            }
        }

        info!(
            delay_secs = config.reconnect_delay_secs,
            "Reconnecting in {} seconds...", config.reconnect_delay_secs
        );
        tokio::time::sleep(Duration::from_secs(config.reconnect_delay_secs)).await;
    }
}
