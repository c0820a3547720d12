//! Agent channel frames.
//!
//! Frames travel as JSON text messages over a WebSocket. The agent must
//! send exactly one [`AgentHello`] first; it is the only frame that
//! carries a capability report unprompted. [`AgentHeartbeat`] has no
//! capability fields at all, so anything extra an agent puts in a
//! heartbeat is dropped during deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DockerInfo, HostId, LogStream, TaskCategory, TaskId};

/// Path of the agent channel endpoint on the control plane.
pub const AGENT_CONNECT_PATH: &str = "/api/agent/connect";

/// Header naming the host the agent connects as.
pub const AGENT_HOST_HEADER: &str = "x-berth-host";

/// First frame on every agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHello {
    /// Must match the identity registered for the host.
    pub agent_id: String,
    pub version: String,
    pub hostname: String,
    pub docker_info: DockerInfo,
}

/// Periodic liveness frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    #[serde(default)]
    pub running_tasks: u32,
}

/// Frames sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Hello(AgentHello),
    Heartbeat(AgentHeartbeat),
    /// Reply to [`ControlFrame::Probe`].
    ProbeResult {
        request_id: String,
        docker_info: DockerInfo,
    },
    Output {
        task_id: TaskId,
        stream: LogStream,
        content: String,
    },
    Finished {
        task_id: TaskId,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Work dispatched to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTask {
    pub task_id: TaskId,
    pub category: TaskCategory,
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Frames sent by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent once the hello has been accepted.
    Welcome { host_id: HostId },
    Execute(ExecuteTask),
    Cancel { task_id: TaskId },
    /// Operator-requested capability refresh.
    Probe { request_id: String },
}

impl AgentFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ControlFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
