//! Berth Control Plane Server

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use berth_control_plane::{http, AppState, Config};

/// Berth control plane: hosts, capabilities, tasks and webhooks.
#[derive(Parser, Debug)]
#[command(name = "berth-control-plane", version)]
struct Args {
    /// HTTP bind address (API, webhooks, agent channel)
    #[arg(long, env = "BERTH_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Simultaneous operations per host
    #[arg(long, default_value_t = 1)]
    per_host_concurrency: usize,

    /// Unfinished tasks allowed per host before submissions are refused
    #[arg(long, default_value_t = 64)]
    max_queued_per_host: usize,

    /// Deadline for each capability check, in seconds
    #[arg(long, default_value_t = 5)]
    probe_timeout_secs: u64,

    /// Grace period for a cancelled task to stop, in seconds
    #[arg(long, default_value_t = 10)]
    cancel_grace_secs: u64,

    /// Deadline for an agent's hello after connecting, in seconds
    #[arg(long, default_value_t = 10)]
    agent_hello_timeout_secs: u64,

    /// Upper bound for one SSH task execution, in seconds
    #[arg(long, default_value_t = 3600)]
    ssh_command_timeout_secs: u64,

    /// Request timeout for Portainer API calls, in seconds
    #[arg(long, default_value_t = 120)]
    portainer_timeout_secs: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            http_addr: args.http_addr,
            per_host_concurrency: args.per_host_concurrency,
            max_queued_per_host: args.max_queued_per_host,
            probe_timeout_secs: args.probe_timeout_secs,
            cancel_grace_secs: args.cancel_grace_secs,
            agent_hello_timeout_secs: args.agent_hello_timeout_secs,
            ssh_command_timeout_secs: args.ssh_command_timeout_secs,
            portainer_timeout_secs: args.portainer_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("berth=info,tower_http=info")),
        )
        .with_target(true)
        .init();

    let config: Config = Args::parse().into();
    let http_addr: SocketAddr = config.http_addr.parse()?;

    info!(
        http_addr = %http_addr,
        per_host_concurrency = config.per_host_concurrency,
        max_queued_per_host = config.max_queued_per_host,
        "Starting Berth control plane"
    );

    let state = AppState::new(config)?;
    let router = http::create_router(state);

    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    if let Err(e) = axum::serve(listener, router).await {
        tracing::error!(error = %e, "HTTP server error");
    }

    Ok(())
}
