//! Record stores for hosts, tasks and pipelines.
//!
//! The control plane only needs create/read/update access to its records;
//! persistence is someone else's concern. The traits here are that seam,
//! and [`MemoryStore`] is the in-process implementation used by the
//! server binary and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use berth_core::{
    CapabilitySnapshot, CoreError, FailureReason, Host, HostId, HostTransportConfig, LogStream,
    Pipeline, PipelineId, Task, TaskId, TaskStatus,
};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Host not found: {0}")]
    HostNotFound(HostId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Task {task_id} is {actual}, expected {expected}")]
    StatusMismatch {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A status change applied atomically with its outcome fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub failure: Option<FailureReason>,
    pub exit_code: Option<i32>,
}

impl StatusChange {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            failure: None,
            exit_code: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            status: TaskStatus::Failed,
            failure: Some(reason),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Host record store.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn insert_host(&self, host: Host) -> Result<(), StoreError>;
    async fn get_host(&self, id: &HostId) -> Option<Host>;
    async fn list_hosts(&self) -> Vec<Host>;
    /// Replace the whole snapshot; fields are never merged.
    async fn replace_capabilities(
        &self,
        id: &HostId,
        snapshot: CapabilitySnapshot,
    ) -> Result<(), StoreError>;
    async fn remove_host(&self, id: &HostId) -> Result<Host, StoreError>;
}

/// Task record store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> Result<(), StoreError>;
    async fn get_task(&self, id: &TaskId) -> Option<Task>;
    /// Tasks ordered by creation time, optionally for one host.
    async fn list_tasks(&self, host_id: Option<&HostId>) -> Vec<Task>;
    /// Append a chunk and return its sequence number.
    async fn append_log(
        &self,
        id: &TaskId,
        stream: LogStream,
        content: String,
    ) -> Result<u64, StoreError>;
    /// Apply a status change, refusing illegal transitions.
    async fn transition(&self, id: &TaskId, change: StatusChange) -> Result<Task, StoreError>;
    /// Apply a status change only while the task is still in `expected`.
    async fn transition_from(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        change: StatusChange,
    ) -> Result<Task, StoreError>;

    /// Number of non-terminal tasks targeting a host.
    async fn active_task_count(&self, host_id: &HostId) -> usize {
        self.list_tasks(Some(host_id))
            .await
            .iter()
            .filter(|t| t.status.is_active())
            .count()
    }
}

/// Pipeline record store.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn insert_pipeline(&self, pipeline: Pipeline) -> Result<(), StoreError>;
    async fn list_pipelines(&self) -> Vec<Pipeline>;
    async fn find_by_token(&self, webhook_token: &str) -> Option<Pipeline>;
    /// Bump `trigger_count` and stamp `last_triggered_at`.
    async fn record_trigger(
        &self,
        id: &PipelineId,
        at: DateTime<Utc>,
    ) -> Result<Pipeline, StoreError>;
}

/// In-memory implementation of all three stores.
#[derive(Default)]
pub struct MemoryStore {
    hosts: RwLock<HashMap<HostId, Host>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn agent_identity(host: &Host) -> Option<&str> {
    match &host.transport {
        HostTransportConfig::Agent(endpoint) => Some(endpoint.identity.as_str()),
        _ => None,
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn insert_host(&self, host: Host) -> Result<(), StoreError> {
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(&host.id) {
            return Err(StoreError::Duplicate(format!("host {}", host.id)));
        }
        if hosts.values().any(|h| h.name == host.name) {
            return Err(StoreError::Duplicate(format!("host name \"{}\"", host.name)));
        }
        if let Some(identity) = agent_identity(&host) {
            if hosts.values().any(|h| agent_identity(h) == Some(identity)) {
                return Err(StoreError::Duplicate(format!("agent identity \"{identity}\"")));
            }
        }
        hosts.insert(host.id.clone(), host);
        Ok(())
    }

    async fn get_host(&self, id: &HostId) -> Option<Host> {
        self.hosts.read().await.get(id).cloned()
    }

    async fn list_hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.read().await.values().cloned().collect();
        hosts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        hosts
    }

    async fn replace_capabilities(
        &self,
        id: &HostId,
        snapshot: CapabilitySnapshot,
    ) -> Result<(), StoreError> {
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get_mut(id)
            .ok_or_else(|| StoreError::HostNotFound(id.clone()))?;
        host.capabilities = Some(snapshot);
        Ok(())
    }

    async fn remove_host(&self, id: &HostId) -> Result<Host, StoreError> {
        self.hosts
            .write()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::HostNotFound(id.clone()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(format!("task {}", task.id)));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    async fn list_tasks(&self, host_id: Option<&HostId>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| host_id.map_or(true, |h| &t.host_id == h))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    async fn append_log(
        &self,
        id: &TaskId,
        stream: LogStream,
        content: String,
    ) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        Ok(task.append_log(stream, content))
    }

    async fn transition(&self, id: &TaskId, change: StatusChange) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        apply_change(task, change)
    }

    async fn transition_from(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        change: StatusChange,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        if task.status != expected {
            return Err(StoreError::StatusMismatch {
                task_id: id.clone(),
                expected,
                actual: task.status,
            });
        }
        apply_change(task, change)
    }
}

fn apply_change(task: &mut Task, change: StatusChange) -> Result<Task, StoreError> {
    task.transition(change.status)?;
    if change.failure.is_some() {
        task.failure = change.failure;
    }
    if change.exit_code.is_some() {
        task.exit_code = change.exit_code;
    }
    Ok(task.clone())
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_pipeline(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines
            .values()
            .any(|p| p.webhook_token == pipeline.webhook_token)
        {
            return Err(StoreError::Duplicate("webhook token".into()));
        }
        pipelines.insert(pipeline.id.clone(), pipeline);
        Ok(())
    }

    async fn list_pipelines(&self) -> Vec<Pipeline> {
        let mut pipelines: Vec<Pipeline> =
            self.pipelines.read().await.values().cloned().collect();
        pipelines.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pipelines
    }

    async fn find_by_token(&self, webhook_token: &str) -> Option<Pipeline> {
        self.pipelines
            .read()
            .await
            .values()
            .find(|p| p.webhook_token == webhook_token)
            .cloned()
    }

    async fn record_trigger(
        &self,
        id: &PipelineId,
        at: DateTime<Utc>,
    ) -> Result<Pipeline, StoreError> {
        let mut pipelines = self.pipelines.write().await;
        let pipeline = pipelines
            .get_mut(id)
            .ok_or_else(|| StoreError::PipelineNotFound(id.clone()))?;
        pipeline.trigger_count += 1;
        pipeline.last_triggered_at = Some(at);
        Ok(pipeline.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{
        ComposeSupport, DeployMode, ProbeTrigger, SwarmMode, TaskCategory, TaskPayload, TaskSpec,
    };

    fn agent_host() -> Host {
        Host::new(
            "edge",
            HostTransportConfig::Agent(berth_core::AgentEndpoint {
                identity: "edge".into(),
                token_hash: "h".into(),
            }),
        )
    }

    #[tokio::test]
    async fn test_capabilities_replaced_not_merged() {
        let store = MemoryStore::new();
        let host = agent_host();
        let id = host.id.clone();
        store.insert_host(host).await.unwrap();

        let first = CapabilitySnapshot::new(
            ComposeSupport::Available {
                version: Some("2.20.0".into()),
            },
            SwarmMode::Active,
            ProbeTrigger::AgentHello,
        );
        store.replace_capabilities(&id, first).await.unwrap();

        let second =
            CapabilitySnapshot::new(ComposeSupport::Unknown, SwarmMode::Inactive, ProbeTrigger::ManualRefresh);
        store.replace_capabilities(&id, second.clone()).await.unwrap();

        let stored = store.get_host(&id).await.unwrap().capabilities.unwrap();
        assert_eq!(stored, second);
        assert_eq!(stored.compose().version(), None);
    }

    #[tokio::test]
    async fn test_transition_rejects_leaving_terminal() {
        let store = MemoryStore::new();
        let task = Task::new(
            TaskSpec::new(
                TaskCategory::Deploy,
                HostId::new("h"),
                TaskPayload::script("true"),
            )
            .with_mode(DeployMode::DockerCompose),
        );
        let id = task.id.clone();
        store.insert_task(task).await.unwrap();

        store
            .transition(&id, StatusChange::to(TaskStatus::Cancelled))
            .await
            .unwrap();
        let err = store
            .transition(&id, StatusChange::to(TaskStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Core(CoreError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_active_task_count() {
        let store = MemoryStore::new();
        let host = HostId::new("h");
        for _ in 0..3 {
            let task = Task::new(TaskSpec::new(
                TaskCategory::Build,
                host.clone(),
                TaskPayload::script("make"),
            ));
            store.insert_task(task).await.unwrap();
        }
        let first = store.list_tasks(Some(&host)).await[0].id.clone();
        store
            .transition(&first, StatusChange::to(TaskStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(store.active_task_count(&host).await, 2);
        assert_eq!(store.active_task_count(&HostId::new("other")).await, 0);
    }

    #[tokio::test]
    async fn test_transition_from_checks_current_status() {
        let store = MemoryStore::new();
        let task = Task::new(TaskSpec::new(
            TaskCategory::Build,
            HostId::new("h"),
            TaskPayload::script("make"),
        ));
        let id = task.id.clone();
        store.insert_task(task).await.unwrap();
        store
            .transition(&id, StatusChange::to(TaskStatus::Running))
            .await
            .unwrap();

        let err = store
            .transition_from(&id, TaskStatus::Queued, StatusChange::to(TaskStatus::Cancelled))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusMismatch {
                actual: TaskStatus::Running,
                ..
            }
        ));
        assert_eq!(store.get_task(&id).await.unwrap().status, TaskStatus::Running);

        let done = store
            .transition_from(&id, TaskStatus::Running, StatusChange::to(TaskStatus::Succeeded))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_insert_host_refuses_taken_name_and_identity() {
        let store = MemoryStore::new();
        store.insert_host(agent_host()).await.unwrap();

        let err = store.insert_host(agent_host()).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(ref what) if what.contains("host name")));

        let same_identity = Host::new(
            "edge-2",
            HostTransportConfig::Agent(berth_core::AgentEndpoint {
                identity: "edge".into(),
                token_hash: "h2".into(),
            }),
        );
        let err = store.insert_host(same_identity).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(ref what) if what.contains("agent identity")));
        assert_eq!(store.list_hosts().await.len(), 1);
    }
}
