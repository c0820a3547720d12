//! Local capability detection.
//!
//! Runs the same two checks the control plane runs over SSH, each with
//! its own deadline. A failed check only degrades its own field.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use berth_core::{DockerInfo, SwarmMode};

#[derive(Debug, Error)]
enum CheckError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

async fn run_check(program: &str, args: &[&str], timeout: Duration) -> Result<String, CheckError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| CheckError::Timeout(timeout))??;

    if !output.status.success() {
        return Err(CheckError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First non-empty line, without a leading `v`.
fn parse_compose_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches('v').to_string())
}

async fn detect_compose(timeout: Duration) -> Option<Option<String>> {
    match run_check("docker", &["compose", "version", "--short"], timeout).await {
        Ok(stdout) => return Some(parse_compose_version(&stdout)),
        Err(e) => debug!(error = %e, "docker compose plugin check failed, trying docker-compose"),
    }
    match run_check("docker-compose", &["version", "--short"], timeout).await {
        Ok(stdout) => Some(parse_compose_version(&stdout)),
        Err(e) => {
            warn!(error = %e, "Compose check failed");
            None
        }
    }
}

async fn detect_swarm(timeout: Duration) -> SwarmMode {
    match run_check("docker", &["info", "--format", "{{.Swarm.LocalNodeState}}"], timeout).await {
        Ok(stdout) => SwarmMode::from_local_node_state(&stdout),
        Err(e) => {
            warn!(error = %e, "Swarm check failed");
            SwarmMode::Unknown
        }
    }
}

fn docker_info(compose: Option<Option<String>>, swarm_mode: SwarmMode) -> DockerInfo {
    DockerInfo {
        compose_supported: compose.is_some(),
        stack_supported: swarm_mode == SwarmMode::Active,
        compose_version: compose.flatten(),
        swarm_mode,
    }
}

/// Detect this machine's Docker capabilities.
pub async fn detect_docker_info(timeout: Duration) -> DockerInfo {
    let (compose, swarm_mode) = tokio::join!(detect_compose(timeout), detect_swarm(timeout));
    docker_info(compose, swarm_mode)
}
