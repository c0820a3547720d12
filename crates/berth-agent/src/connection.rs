//! Agent channel to the control plane.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::HeaderName;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use berth_core::protocol::{AgentFrame, AgentHeartbeat, AgentHello, ControlFrame, AGENT_HOST_HEADER};
use berth_core::TaskId;

use crate::config::Config;
use crate::detect::detect_docker_info;
use crate::executor::run_task;

/// Errors that end a connection attempt.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("outbound channel closed")]
    ChannelClosed,
}

type RunningTasks = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

/// One session with the control plane.
pub struct AgentConnection {
    config: Arc<Config>,
    running: RunningTasks,
}

impl AgentConnection {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect, announce, and serve control frames until the channel drops.
    pub async fn connect_and_run(&mut self) -> Result<(), AgentError> {
        let url = self.config.connect_url();
        info!(url = %url, host = %self.config.host_id, "Connecting to control plane");

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.token))?,
        );
        headers.insert(
            HeaderName::from_static(AGENT_HOST_HEADER),
            HeaderValue::from_str(&self.config.host_id)?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();
        info!("Connected to control plane");

        let (tx, mut rx) = mpsc::channel::<AgentFrame>(256);

        let writer_handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Failed to write frame");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let docker_info = detect_docker_info(self.config.detect_timeout()).await;
        info!(
            compose = docker_info.compose_supported,
            swarm = %docker_info.swarm_mode,
            "Detected local Docker capabilities"
        );
        tx.send(AgentFrame::Hello(AgentHello {
            agent_id: self.config.agent_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: local_hostname(&self.config.agent_id),
            docker_info,
        }))
        .await
        .map_err(|_| AgentError::ChannelClosed)?;

        let heartbeat_handle = {
            let tx = tx.clone();
            let running = self.running.clone();
            let agent_id = self.config.agent_id.clone();
            let period = self.config.heartbeat_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let running_tasks = running.lock().map(|r| r.len()).unwrap_or(0) as u32;
                    let heartbeat = AgentFrame::Heartbeat(AgentHeartbeat {
                        agent_id: agent_id.clone(),
                        running_tasks,
                    });
                    if tx.send(heartbeat).await.is_err() {
                        break;
                    }
                    debug!(running_tasks, "Sent heartbeat");
                }
            })
        };

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match ControlFrame::from_json(text.as_str()) {
                    Ok(frame) => self.handle_control_frame(frame, &tx),
                    Err(e) => warn!(error = %e, "Ignoring malformed control frame"),
                },
                Ok(Message::Close(_)) => {
                    info!("Control plane closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Error receiving from control plane");
                    break;
                }
            }
        }

        heartbeat_handle.abort();
        self.cancel_all();
        drop(tx);
        writer_handle.abort();

        Ok(())
    }

    fn handle_control_frame(&self, frame: ControlFrame, tx: &mpsc::Sender<AgentFrame>) {
        match frame {
            ControlFrame::Welcome { host_id } => {
                info!(host_id = %host_id, "Registered with control plane");
            }
            ControlFrame::Execute(task) => {
                let cancel = CancellationToken::new();
                match self.running.lock() {
                    Ok(mut running) => {
                        running.insert(task.task_id.clone(), cancel.clone());
                    }
                    Err(_) => {
                        error!(task_id = %task.task_id, "Running task table poisoned");
                        return;
                    }
                }

                info!(task_id = %task.task_id, category = %task.category, "Received task");
                let tx = tx.clone();
                let running = self.running.clone();
                let shell = self.config.shell.clone();
                tokio::spawn(async move {
                    let finished = run_task(&shell, &task, &tx, cancel).await;
                    if let Ok(mut running) = running.lock() {
                        running.remove(&task.task_id);
                    }
                    if tx.send(finished).await.is_err() {
                        warn!(task_id = %task.task_id, "Connection gone before task finished");
                    }
                });
            }
            ControlFrame::Cancel { task_id } => {
                let token = self
                    .running
                    .lock()
                    .ok()
                    .and_then(|running| running.get(&task_id).cloned());
                match token {
                    Some(token) => {
                        info!(task_id = %task_id, "Cancelling task");
                        token.cancel();
                    }
                    None => debug!(task_id = %task_id, "Cancel for unknown task"),
                }
            }
            ControlFrame::Probe { request_id } => {
                let tx = tx.clone();
                let timeout = self.config.detect_timeout();
                tokio::spawn(async move {
                    let docker_info = detect_docker_info(timeout).await;
                    let reply = AgentFrame::ProbeResult {
                        request_id,
                        docker_info,
                    };
                    if tx.send(reply).await.is_err() {
                        debug!("Connection gone before probe result");
                    }
                });
            }
        }
    }

    fn cancel_all(&self) {
        if let Ok(mut running) = self.running.lock() {
            for (task_id, token) in running.drain() {
                debug!(task_id = %task_id, "Cancelling task on disconnect");
                token.cancel();
            }
        }
    }
}

fn local_hostname(fallback: &str) -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
