//! SSH transport using russh.
//!
//! Every probe and every execution opens its own session and closes it
//! when done. Sessions are never shared between concurrent commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use berth_core::{ComposeSupport, LogStream, SshAuth, SshEndpoint, SwarmMode, Task};

use super::{
    shell_quote, shell_script, ExecOutcome, HostTransport, LogLine, LogSink, ProbeReport,
    TransportError,
};
use crate::detector::ProbeError;

/// Compose plugin check, falling back to the standalone binary.
pub const COMPOSE_CHECK: &str =
    "docker compose version --short 2>/dev/null || docker-compose version --short";

/// Swarm node state check.
pub const SWARM_CHECK: &str = "docker info --format '{{.Swarm.LocalNodeState}}'";

/// Host key verification against known_hosts.
struct KnownHostsHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
}

impl client::Handler for KnownHostsHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let known = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match known {
            Ok(true) => Ok(true),
            Err(russh::keys::Error::KeyChanged { .. }) => {
                warn!(host = %self.host, port = self.port, "Host key changed, refusing connection");
                Ok(false)
            }
            Ok(false) | Err(_) if self.trust_on_first_use => {
                warn!(host = %self.host, port = self.port, "Trusting unknown host key on first use");
                let learned = match &self.known_hosts_path {
                    Some(path) => learn_known_hosts_path(&self.host, self.port, server_public_key, path),
                    None => learn_known_hosts(&self.host, self.port, server_public_key),
                };
                if let Err(e) = learned {
                    warn!(host = %self.host, error = %e, "Failed to save host key");
                }
                Ok(true)
            }
            Ok(false) | Err(_) => Ok(false),
        }
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

/// Transport for SSH-kind hosts.
pub struct SshTransport {
    endpoint: SshEndpoint,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl SshTransport {
    pub fn new(endpoint: SshEndpoint, probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            endpoint,
            probe_timeout,
            command_timeout,
        }
    }

    async fn connect(&self) -> Result<Handle<KnownHostsHandler>, TransportError> {
        let endpoint = &self.endpoint;
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let handler = KnownHostsHandler {
            host: endpoint.address.clone(),
            port: endpoint.port,
            trust_on_first_use: endpoint.trust_on_first_use,
            known_hosts_path: endpoint.known_hosts_path.clone(),
        };

        let connecting = client::connect(
            Arc::new(config),
            (endpoint.address.as_str(), endpoint.port),
            handler,
        );
        let mut session = tokio::time::timeout(self.probe_timeout, connecting)
            .await
            .map_err(|_| {
                TransportError::Unreachable(format!(
                    "connection to {}:{} timed out",
                    endpoint.address, endpoint.port
                ))
            })?
            .map_err(|e| TransportError::Unreachable(format!("{}:{}: {e}", endpoint.address, endpoint.port)))?;

        let authenticated = match &endpoint.auth {
            SshAuth::Password { password } => session
                .authenticate_password(&endpoint.username, password)
                .await
                .map_err(|e| TransportError::Authentication(e.to_string()))?
                .success(),
            SshAuth::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    TransportError::Authentication(format!("failed to load key {}: {e}", path.display()))
                })?;
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| TransportError::Authentication(e.to_string()))?
                    .flatten();
                session
                    .authenticate_publickey(
                        &endpoint.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| TransportError::Authentication(e.to_string()))?
                    .success()
            }
        };

        if !authenticated {
            return Err(TransportError::Authentication(format!(
                "{}@{} rejected the credentials",
                endpoint.username, endpoint.address
            )));
        }
        Ok(session)
    }

    async fn close(session: Handle<KnownHostsHandler>) {
        if let Err(e) = session.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Run one command on its own channel and capture its output.
async fn run_captured(
    session: &Handle<KnownHostsHandler>,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, ProbeError> {
    let capture = async {
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ProbeError::CommandFailed(format!("failed to open channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ProbeError::CommandFailed(format!("failed to exec: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code
            .ok_or_else(|| ProbeError::CommandFailed("channel closed without exit status".into()))?;
        Ok::<_, ProbeError>(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    };

    tokio::time::timeout(timeout, capture)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

/// Interpret the compose version check.
pub fn compose_from_output(output: &CommandOutput) -> Result<ComposeSupport, ProbeError> {
    if output.exit_code != 0 {
        return Err(ProbeError::CommandFailed(format!(
            "compose check exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    let version = output
        .stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches('v').to_string());
    Ok(ComposeSupport::Available { version })
}

/// Interpret the swarm state check.
pub fn swarm_from_output(output: &CommandOutput) -> Result<SwarmMode, ProbeError> {
    if output.exit_code != 0 {
        return Err(ProbeError::CommandFailed(format!(
            "docker info exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(SwarmMode::from_local_node_state(&output.stdout))
}

/// Splits a byte stream into complete lines.
struct LineBuffer {
    stream: LogStream,
    pending: Vec<u8>,
}

impl LineBuffer {
    fn new(stream: LogStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) -> Vec<LogLine> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(LogLine {
                stream: self.stream,
                content: text.trim_end_matches('\r').to_string(),
            });
        }
        lines
    }

    fn finish(&mut self) -> Option<LogLine> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(LogLine {
            stream: self.stream,
            content: text,
        })
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Prefix the script with `export` lines for the task environment.
fn remote_command(task: &Task, script: &str) -> Result<String, TransportError> {
    let mut command = String::new();
    for (name, value) in &task.payload.env {
        if !is_env_name(name) {
            return Err(TransportError::Unsupported(format!(
                "invalid environment variable name: {name}"
            )));
        }
        command.push_str(&format!("export {name}={}\n", shell_quote(value)));
    }
    command.push_str(script);
    Ok(command)
}

#[async_trait]
impl HostTransport for SshTransport {
    async fn probe(&self) -> Result<ProbeReport, TransportError> {
        let session = self.connect().await?;

        let (compose, swarm) = tokio::join!(
            run_captured(&session, COMPOSE_CHECK, self.probe_timeout),
            run_captured(&session, SWARM_CHECK, self.probe_timeout),
        );
        Self::close(session).await;

        Ok(ProbeReport {
            compose: compose.and_then(|o| compose_from_output(&o)),
            swarm_mode: swarm.and_then(|o| swarm_from_output(&o)),
        })
    }

    async fn execute(
        &self,
        task: &Task,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, TransportError> {
        let script = shell_script(task).ok_or_else(|| {
            TransportError::Unsupported("ssh hosts need a script or a compose file to run".into())
        })?;
        let command = remote_command(task, &script)?;

        let session = self.connect().await?;
        let mut channel = match session.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                Self::close(session).await;
                return Err(TransportError::Remote(format!("failed to open channel: {e}")));
            }
        };
        if let Err(e) = channel.exec(true, command).await {
            Self::close(session).await;
            return Err(TransportError::Remote(format!("failed to exec: {e}")));
        }

        let mut stdout = LineBuffer::new(LogStream::Stdout);
        let mut stderr = LineBuffer::new(LogStream::Stderr);
        let mut exit_code = None;
        let deadline = tokio::time::sleep(self.command_timeout);
        tokio::pin!(deadline);

        let result = loop {
            let msg = tokio::select! {
                msg = channel.wait() => msg,
                _ = cancel.cancelled() => break Err(TransportError::Cancelled),
                _ = &mut deadline => {
                    break Err(TransportError::Remote(format!(
                        "command exceeded {}s",
                        self.command_timeout.as_secs()
                    )));
                }
            };

            let lines = match msg {
                Some(ChannelMsg::Data { data }) => stdout.push(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.push(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status as i32);
                    Vec::new()
                }
                Some(ChannelMsg::Close) | None => match exit_code {
                    Some(code) => break Ok(ExecOutcome::exited(code)),
                    None => {
                        break Err(TransportError::Unreachable(
                            "channel closed without exit status".into(),
                        ))
                    }
                },
                Some(_) => Vec::new(),
            };
            for line in lines {
                let _ = log.send(line).await;
            }
        };

        for line in [stdout.finish(), stderr.finish()].into_iter().flatten() {
            let _ = log.send(line).await;
        }
        let _ = channel.close().await;
        Self::close(session).await;
        result
    }
}
