//! Long-lived agent channels.
//!
//! Agents connect over a WebSocket at [`AGENT_CONNECT_PATH`]. The HTTP
//! handler authenticates the bearer token before the upgrade; this module
//! takes over afterwards: it waits for the hello, hands the reported
//! `docker_info` to the detector, and then routes frames until the socket
//! closes. A channel is addressable by host id. A new connection for the
//! same host replaces the old one.
//!
//! [`AGENT_CONNECT_PATH`]: berth_core::protocol::AGENT_CONNECT_PATH

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_core::protocol::{AgentFrame, AgentHello, ControlFrame, ExecuteTask};
use berth_core::{DockerInfo, Host, HostId, HostTransportConfig, LogStream, Task, TaskId};

use super::{
    shell_script, ExecOutcome, HostTransport, LogLine, LogSink, ProbeReport, ReachabilityTable,
    TransportError,
};
use crate::detector::CapabilityDetector;

/// Task output routed from an agent channel to the waiting transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTaskEvent {
    Output { stream: LogStream, content: String },
    Finished { exit_code: Option<i32>, error: Option<String> },
}

/// Public view of a connected agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSessionInfo {
    pub agent_id: String,
    pub hostname: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
}

struct AgentSession {
    session_id: u64,
    tx: mpsc::Sender<ControlFrame>,
    shutdown: CancellationToken,
    info: AgentSessionInfo,
}

struct PendingTask {
    session_id: u64,
    events: mpsc::Sender<AgentTaskEvent>,
}

struct PendingProbe {
    session_id: u64,
    reply: oneshot::Sender<DockerInfo>,
}

/// Handle returned when a session is attached.
pub struct AttachedSession {
    pub session_id: u64,
    pub outbound: mpsc::Receiver<ControlFrame>,
    pub shutdown: CancellationToken,
}

/// Registry of live agent channels.
pub struct AgentHub {
    sessions: RwLock<HashMap<HostId, AgentSession>>,
    pending_tasks: Mutex<HashMap<TaskId, PendingTask>>,
    pending_probes: Mutex<HashMap<String, PendingProbe>>,
    next_session: AtomicU64,
    reachability: Arc<ReachabilityTable>,
}

impl AgentHub {
    pub fn new(reachability: Arc<ReachabilityTable>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending_tasks: Mutex::new(HashMap::new()),
            pending_probes: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            reachability,
        }
    }

    /// Serve an upgraded, already-authenticated agent socket until it closes.
    pub async fn serve(
        self: Arc<Self>,
        socket: WebSocket,
        host: Host,
        detector: Arc<CapabilityDetector>,
        hello_timeout: Duration,
    ) {
        let identity = match &host.transport {
            HostTransportConfig::Agent(endpoint) => endpoint.identity.clone(),
            _ => return,
        };
        let host_id = host.id.clone();
        let (mut sink, mut stream) = socket.split();

        let hello = match tokio::time::timeout(hello_timeout, next_frame(&mut stream)).await {
            Ok(Some(Ok(AgentFrame::Hello(hello)))) => hello,
            Ok(Some(Ok(_))) => {
                warn!(host_id = %host_id, "First agent frame was not a hello, closing");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(host_id = %host_id, error = %e, "Malformed hello, closing");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(
                    host_id = %host_id,
                    timeout_secs = hello_timeout.as_secs(),
                    "No hello before deadline, closing"
                );
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        };

        if hello.agent_id != identity {
            warn!(
                host_id = %host_id,
                agent_id = %hello.agent_id,
                "Agent identity does not match the registered host, closing"
            );
            let _ = sink.send(Message::Close(None)).await;
            return;
        }

        if let Err(e) = detector.record_agent_hello(&host_id, &hello.docker_info).await {
            warn!(host_id = %host_id, error = %e, "Failed to record agent capabilities");
        }

        let AttachedSession {
            session_id,
            mut outbound,
            shutdown,
        } = self.attach(&host_id, &hello).await;

        info!(
            host_id = %host_id,
            agent_id = %hello.agent_id,
            hostname = %hello.hostname,
            version = %hello.version,
            "Agent connected"
        );

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode control frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.send(
            &host_id,
            ControlFrame::Welcome {
                host_id: host_id.clone(),
            },
        )
        .await
        .ok();

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = next_frame(&mut stream) => frame,
            };
            match frame {
                Some(Ok(frame)) => self.handle_frame(&host_id, session_id, frame).await,
                Some(Err(e)) => warn!(host_id = %host_id, error = %e, "Dropping malformed agent frame"),
                None => break,
            }
        }

        writer.abort();
        self.detach(&host_id, session_id).await;
        info!(host_id = %host_id, "Agent disconnected");
    }

    /// Make a session addressable by host id, replacing any previous one.
    pub async fn attach(&self, host_id: &HostId, hello: &AgentHello) -> AttachedSession {
        let (tx, outbound) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);

        let session = AgentSession {
            session_id,
            tx,
            shutdown: shutdown.clone(),
            info: AgentSessionInfo {
                agent_id: hello.agent_id.clone(),
                hostname: hello.hostname.clone(),
                version: hello.version.clone(),
                connected_at: Utc::now(),
            },
        };

        let replaced = self.sessions.write().await.insert(host_id.clone(), session);
        if let Some(old) = replaced {
            info!(host_id = %host_id, "Replacing existing agent channel");
            old.shutdown.cancel();
        }
        self.reachability.mark_connected(host_id).await;

        AttachedSession {
            session_id,
            outbound,
            shutdown,
        }
    }

    /// Tear down a session's state. A replaced session only drops its own
    /// pending work.
    pub async fn detach(&self, host_id: &HostId, session_id: u64) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(host_id) {
                Some(current) if current.session_id == session_id => sessions.remove(host_id),
                _ => None,
            }
        };

        lock(&self.pending_tasks).retain(|_, p| p.session_id != session_id);
        lock(&self.pending_probes).retain(|_, p| p.session_id != session_id);

        if removed.is_some() {
            self.reachability.mark_unreachable(host_id).await;
        }
    }

    /// Close the channel for a host, if any.
    pub async fn disconnect(&self, host_id: &HostId) {
        if let Some(session) = self.sessions.read().await.get(host_id) {
            session.shutdown.cancel();
        }
    }

    pub async fn is_connected(&self, host_id: &HostId) -> bool {
        self.sessions.read().await.contains_key(host_id)
    }

    pub async fn session_info(&self, host_id: &HostId) -> Option<AgentSessionInfo> {
        self.sessions
            .read()
            .await
            .get(host_id)
            .map(|s| s.info.clone())
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Route one inbound frame from an established session.
    pub async fn handle_frame(&self, host_id: &HostId, session_id: u64, frame: AgentFrame) {
        match frame {
            AgentFrame::Hello(hello) => {
                warn!(host_id = %host_id, agent_id = %hello.agent_id, "Ignoring repeated hello");
            }
            AgentFrame::Heartbeat(heartbeat) => {
                debug!(
                    host_id = %host_id,
                    running_tasks = heartbeat.running_tasks,
                    "Heartbeat received"
                );
                self.reachability.record_heartbeat(host_id).await;
            }
            AgentFrame::ProbeResult {
                request_id,
                docker_info,
            } => {
                let pending = lock(&self.pending_probes).remove(&request_id);
                match pending {
                    Some(p) if p.session_id == session_id => {
                        let _ = p.reply.send(docker_info);
                    }
                    _ => warn!(host_id = %host_id, request_id = %request_id, "Probe result for unknown request"),
                }
            }
            AgentFrame::Output {
                task_id,
                stream,
                content,
            } => {
                self.route(host_id, session_id, &task_id, AgentTaskEvent::Output { stream, content })
                    .await;
            }
            AgentFrame::Finished {
                task_id,
                exit_code,
                error,
            } => {
                self.route(host_id, session_id, &task_id, AgentTaskEvent::Finished { exit_code, error })
                    .await;
            }
        }
    }

    async fn route(&self, host_id: &HostId, session_id: u64, task_id: &TaskId, event: AgentTaskEvent) {
        let events = lock(&self.pending_tasks)
            .get(task_id)
            .filter(|p| p.session_id == session_id)
            .map(|p| p.events.clone());

        match events {
            Some(events) => {
                if events.send(event).await.is_err() {
                    debug!(task_id = %task_id, "Task no longer waiting for agent output");
                }
            }
            None => warn!(host_id = %host_id, task_id = %task_id, "Agent frame for unknown task"),
        }
    }

    async fn send(&self, host_id: &HostId, frame: ControlFrame) -> Result<u64, TransportError> {
        let (tx, session_id) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(host_id)
                .ok_or_else(|| TransportError::Unreachable("agent is not connected".into()))?;
            (session.tx.clone(), session.session_id)
        };
        tx.send(frame)
            .await
            .map_err(|_| TransportError::Unreachable("agent channel closed".into()))?;
        Ok(session_id)
    }

    /// Send a task to the host's agent and subscribe to its output.
    async fn dispatch(
        &self,
        host_id: &HostId,
        execute: ExecuteTask,
    ) -> Result<(mpsc::Receiver<AgentTaskEvent>, PendingGuard<'_>), TransportError> {
        let session_id = self
            .sessions
            .read()
            .await
            .get(host_id)
            .map(|s| s.session_id)
            .ok_or_else(|| TransportError::Unreachable("agent is not connected".into()))?;

        let task_id = execute.task_id.clone();
        let (events_tx, events_rx) = mpsc::channel(256);
        lock(&self.pending_tasks).insert(
            task_id.clone(),
            PendingTask {
                session_id,
                events: events_tx,
            },
        );
        let guard = PendingGuard { hub: self, task_id };

        let sent_on = self.send(host_id, ControlFrame::Execute(execute)).await?;
        if sent_on != session_id {
            return Err(TransportError::Unreachable("agent reconnected during dispatch".into()));
        }
        Ok((events_rx, guard))
    }

    /// Ask the connected agent for a fresh capability report.
    pub async fn request_probe(&self, host_id: &HostId, timeout: Duration) -> Result<DockerInfo, TransportError> {
        let request_id = format!("{:016x}", rand::random::<u64>());
        let (reply_tx, reply_rx) = oneshot::channel();

        let session_id = self
            .sessions
            .read()
            .await
            .get(host_id)
            .map(|s| s.session_id)
            .ok_or_else(|| TransportError::Unreachable("agent is not connected".into()))?;
        lock(&self.pending_probes).insert(
            request_id.clone(),
            PendingProbe {
                session_id,
                reply: reply_tx,
            },
        );

        let result = match self
            .send(
                host_id,
                ControlFrame::Probe {
                    request_id: request_id.clone(),
                },
            )
            .await
        {
            Ok(_) => match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(info)) => Ok(info),
                Ok(Err(_)) => Err(TransportError::Unreachable("agent disconnected during probe".into())),
                Err(_) => Err(TransportError::Unreachable("agent did not answer the probe in time".into())),
            },
            Err(e) => Err(e),
        };

        lock(&self.pending_probes).remove(&request_id);
        result
    }
}

struct PendingGuard<'a> {
    hub: &'a AgentHub,
    task_id: TaskId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.hub.pending_tasks).remove(&self.task_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read the next JSON frame, skipping control messages.
async fn next_frame(stream: &mut SplitStream<WebSocket>) -> Option<Result<AgentFrame, String>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(AgentFrame::from_json(&text).map_err(|e| e.to_string())),
            Ok(Message::Binary(_)) => return Some(Err("binary frames are not supported".into())),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Agent socket error");
                return None;
            }
        }
    }
    None
}

/// Transport for agent-kind hosts.
pub struct AgentTransport {
    hub: Arc<AgentHub>,
    host_id: HostId,
    probe_timeout: Duration,
}

impl AgentTransport {
    pub fn new(hub: Arc<AgentHub>, host_id: HostId, probe_timeout: Duration) -> Self {
        Self {
            hub,
            host_id,
            probe_timeout,
        }
    }
}

#[async_trait]
impl HostTransport for AgentTransport {
    async fn probe(&self) -> Result<ProbeReport, TransportError> {
        let info = self.hub.request_probe(&self.host_id, self.probe_timeout).await?;
        Ok(ProbeReport::from_docker_info(&info))
    }

    async fn execute(
        &self,
        task: &Task,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, TransportError> {
        let script = shell_script(task).ok_or_else(|| {
            TransportError::Unsupported("agent hosts need a script or a compose file to run".into())
        })?;

        let execute = ExecuteTask {
            task_id: task.id.clone(),
            category: task.category,
            script,
            env: task.payload.env.clone(),
        };
        let (mut events, _guard) = self.hub.dispatch(&self.host_id, execute).await?;

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(AgentTaskEvent::Output { stream, content }) => {
                        if log.send(LogLine { stream, content }).await.is_err() {
                            debug!(task_id = %task.id, "Log sink closed");
                        }
                    }
                    Some(AgentTaskEvent::Finished { exit_code: None, error: Some(error) }) => {
                        return Err(TransportError::Remote(error));
                    }
                    Some(AgentTaskEvent::Finished { exit_code, error }) => {
                        if let Some(error) = error {
                            let _ = log.send(LogLine::system(error)).await;
                        }
                        return Ok(ExecOutcome { exit_code });
                    }
                    None => {
                        return Err(TransportError::Unreachable(
                            "agent channel closed before the task finished".into(),
                        ));
                    }
                },
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    let frame = ControlFrame::Cancel { task_id: task.id.clone() };
                    if let Err(e) = self.hub.send(&self.host_id, frame).await {
                        warn!(task_id = %task.id, error = %e, "Failed to send cancel to agent");
                        return Err(TransportError::Cancelled);
                    }
                }
            }
        }
    }
}
