//! Task types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityGap;
use crate::{CoreError, DeployMode, HostId, PipelineId, TaskId, TaskStatus};

/// Kind of work a Task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Build,
    Export,
    Deploy,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Export => "export",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque description of the operation to run on the host.
///
/// Agent and SSH hosts run `script` through a shell with `env` set.
/// Portainer hosts deploy `compose_file` as a stack named `stack_name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TaskPayload {
    /// Payload that runs a shell script.
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Builder method to add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Who created a Task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Submitted directly through the API.
    #[default]
    Api,
    /// Submitted by a webhook delivery for a pipeline.
    Pipeline { pipeline_id: PipelineId },
}

/// A submission request for a new Task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub category: TaskCategory,
    pub host_id: HostId,
    #[serde(default)]
    pub requested_mode: Option<DeployMode>,
    #[serde(default)]
    pub payload: TaskPayload,
    #[serde(default)]
    pub origin: TaskOrigin,
}

impl TaskSpec {
    pub fn new(category: TaskCategory, host_id: HostId, payload: TaskPayload) -> Self {
        Self {
            category,
            host_id,
            requested_mode: None,
            payload,
            origin: TaskOrigin::Api,
        }
    }

    /// Builder method to set the deploy mode.
    pub fn with_mode(mut self, mode: DeployMode) -> Self {
        self.requested_mode = Some(mode);
        self
    }

    /// Builder method to set the origin.
    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Deploy tasks need a mode; other categories must not carry one.
    pub fn validate(&self) -> Result<(), CoreError> {
        match (self.category, self.requested_mode) {
            (TaskCategory::Deploy, None) => {
                return Err(CoreError::InvalidInput(
                    "deploy tasks require requested_mode (docker-compose or docker-stack)".into(),
                ));
            }
            (TaskCategory::Build | TaskCategory::Export, Some(_)) => {
                return Err(CoreError::InvalidInput(format!(
                    "requested_mode only applies to deploy tasks, not {}",
                    self.category
                )));
            }
            _ => {}
        }

        if self.payload.script.trim().is_empty() && self.payload.compose_file.is_none() {
            return Err(CoreError::InvalidInput(
                "payload needs a script or a compose_file".into(),
            ));
        }

        if let Some(name) = self.payload.stack_name.as_deref().filter(|n| !n.trim().is_empty()) {
            validate_stack_name(name)?;
        }

        Ok(())
    }
}

/// Stack and project names: lowercase alphanumerics, `_` and `-`,
/// starting with a letter or digit.
fn validate_stack_name(name: &str) -> Result<(), CoreError> {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-';
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !starts_ok || !name.chars().all(valid_char) {
        return Err(CoreError::InvalidInput(format!(
            "invalid stack name \"{name}\": use lowercase letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

/// Which stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the control plane itself (errors, cancellation).
    System,
}

/// One ordered piece of task output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Position in the task log, starting at 0.
    pub seq: u64,
    pub stream: LogStream,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Why a Task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The host's cached capabilities do not allow the requested mode.
    CapabilityMismatch {
        host_name: String,
        mode: DeployMode,
        gap: CapabilityGap,
    },
    /// The operation ran and exited non-zero.
    NonZeroExit { exit_code: i32 },
    /// The transport failed (unreachable, dropped channel, API error).
    Transport { message: String },
    /// The host's transport cannot perform this category.
    Unsupported { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapabilityMismatch {
                host_name,
                mode,
                gap,
            } => write!(f, "host \"{host_name}\" cannot run {mode} deployments: {gap}"),
            Self::NonZeroExit { exit_code } => write!(f, "operation exited with status {exit_code}"),
            Self::Transport { message } => write!(f, "transport error: {message}"),
            Self::Unsupported { message } => f.write_str(message),
        }
    }
}

/// One build/export/deploy unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    pub category: TaskCategory,

    /// Target host (foreign reference only).
    pub host_id: HostId,

    /// Current task status.
    pub status: TaskStatus,

    /// Append-only ordered output.
    pub log: Vec<LogChunk>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Deploy mode (deploy tasks only).
    pub requested_mode: Option<DeployMode>,

    pub payload: TaskPayload,

    /// Set when the task fails.
    pub failure: Option<FailureReason>,

    /// Exit status reported by the transport, if any.
    pub exit_code: Option<i32>,

    pub origin: TaskOrigin,
}

impl Task {
    /// Create a new queued Task from a spec.
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::generate(),
            category: spec.category,
            host_id: spec.host_id,
            status: TaskStatus::Queued,
            log: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            requested_mode: spec.requested_mode,
            payload: spec.payload,
            failure: None,
            exit_code: None,
            origin: spec.origin,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition, stamping timestamps.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Append a log chunk with the next sequence number.
    pub fn append_log(&mut self, stream: LogStream, content: impl Into<String>) -> u64 {
        let seq = self.log.len() as u64;
        self.log.push(LogChunk {
            seq,
            stream,
            content: content.into(),
            at: Utc::now(),
        });
        seq
    }
}
