//! Task orchestrator - runs tasks against their hosts.
//!
//! Every task moves `queued -> running -> (succeeded | failed | cancelled)`.
//! Deploys are checked against the host's cached capability snapshot
//! before anything touches the host. Each host has a slot holding a
//! semaphore for `per_host_concurrency`, a deploy lock that keeps deploys
//! serial, and a counter of non-terminal tasks capped at
//! `max_queued_per_host`. Different hosts never share a slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_core::capability::check_deploy_mode;
use berth_core::{
    FailureReason, Host, HostId, LogStream, Task, TaskCategory, TaskId, TaskSpec, TaskStatus,
};

use crate::config::Config;
use crate::connection::{LogLine, TransportError, TransportProvider};
use crate::registry::{HostRegistry, RegistryError};
use crate::store::{StatusChange, StoreError, TaskStore};

/// Orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Invalid(String),

    #[error("Host not found: {0}")]
    HostNotFound(HostId),

    #[error("Host {host_id} already has {limit} unfinished task(s)")]
    HostBusy { host_id: HostId, limit: usize },

    #[error("{reason}")]
    CapabilityMismatch {
        task_id: TaskId,
        reason: FailureReason,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task_id} is already {status}")]
    TaskNotCancellable { task_id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct HostSlot {
    permits: Arc<Semaphore>,
    deploy_lock: Arc<tokio::sync::Mutex<()>>,
    in_flight: AtomicUsize,
}

impl HostSlot {
    fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            deploy_lock: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct TaskHandle {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Runs tasks against hosts.
pub struct TaskOrchestrator {
    registry: Arc<HostRegistry>,
    tasks: Arc<dyn TaskStore>,
    transports: Arc<dyn TransportProvider>,
    per_host_concurrency: usize,
    max_queued_per_host: usize,
    cancel_grace: Duration,
    slots: Mutex<HashMap<HostId, Arc<HostSlot>>>,
    running: Mutex<HashMap<TaskId, TaskHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskOrchestrator {
    pub fn new(
        config: &Config,
        registry: Arc<HostRegistry>,
        tasks: Arc<dyn TaskStore>,
        transports: Arc<dyn TransportProvider>,
    ) -> Self {
        Self {
            registry,
            tasks,
            transports,
            per_host_concurrency: config.per_host_concurrency,
            max_queued_per_host: config.max_queued_per_host,
            cancel_grace: config.cancel_grace(),
            slots: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task, OrchestratorError> {
        self.tasks
            .get_task(id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.clone()))
    }

    pub async fn list_tasks(&self, host_id: Option<&HostId>) -> Vec<Task> {
        self.tasks.list_tasks(host_id).await
    }

    /// Accept a task and start it in the background.
    ///
    /// A deploy whose mode the host's snapshot does not allow is stored as
    /// `failed` and reported as [`OrchestratorError::CapabilityMismatch`];
    /// its host is never contacted.
    pub async fn submit(self: &Arc<Self>, spec: TaskSpec) -> Result<Task, OrchestratorError> {
        spec.validate()
            .map_err(|e| OrchestratorError::Invalid(e.to_string()))?;

        let host = match self.registry.get(&spec.host_id).await {
            Ok(host) => host,
            Err(RegistryError::NotFound(id)) => return Err(OrchestratorError::HostNotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let slot = self.reserve(&host.id)?;
        let task = Task::new(spec);
        if let Err(e) = self.tasks.insert_task(task.clone()).await {
            slot.release();
            return Err(e.into());
        }

        if let (TaskCategory::Deploy, Some(mode)) = (task.category, task.requested_mode) {
            if let Err(gap) = check_deploy_mode(host.capabilities.as_ref(), mode) {
                slot.release();
                let reason = FailureReason::CapabilityMismatch {
                    host_name: host.name.clone(),
                    mode,
                    gap,
                };
                // Terminal first: a queued record with no worker would never finish.
                self.tasks
                    .transition(&task.id, StatusChange::failed(reason.clone()))
                    .await?;
                self.system_line(&task.id, &reason.to_string()).await;
                warn!(
                    task_id = %task.id,
                    host_id = %host.id,
                    mode = %mode,
                    %gap,
                    "Deploy rejected by capability check"
                );
                return Err(OrchestratorError::CapabilityMismatch {
                    task_id: task.id,
                    reason,
                });
            }
        }

        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        lock(&self.running).insert(
            task.id.clone(),
            TaskHandle {
                token: token.clone(),
                done: done_rx,
            },
        );

        info!(
            task_id = %task.id,
            host_id = %host.id,
            category = %task.category,
            "Task queued"
        );

        let this = Arc::clone(self);
        let queued = task.clone();
        tokio::spawn(async move {
            this.run_task(queued, host, slot.clone(), token).await;
            slot.release();
            let _ = done_tx.send(true);
        });

        Ok(task)
    }

    fn reserve(&self, host_id: &HostId) -> Result<Arc<HostSlot>, OrchestratorError> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .entry(host_id.clone())
            .or_insert_with(|| Arc::new(HostSlot::new(self.per_host_concurrency)))
            .clone();
        if slot.in_flight.load(Ordering::SeqCst) >= self.max_queued_per_host {
            return Err(OrchestratorError::HostBusy {
                host_id: host_id.clone(),
                limit: self.max_queued_per_host,
            });
        }
        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(slot)
    }

    async fn run_task(&self, task: Task, host: Host, slot: Arc<HostSlot>, token: CancellationToken) {
        let task_id = task.id.clone();
        let is_deploy = task.category == TaskCategory::Deploy;

        // Deploy lock first so a waiting deploy does not sit on a permit.
        let acquired = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            guards = async {
                let deploy = if is_deploy {
                    Some(slot.deploy_lock.clone().lock_owned().await)
                } else {
                    None
                };
                let permit = slot.permits.clone().acquire_owned().await.ok()?;
                Some((deploy, permit))
            } => guards,
        };

        let Some(_guards) = acquired else {
            self.finish_queued_cancel(&task_id).await;
            lock(&self.running).remove(&task_id);
            return;
        };

        if let Err(e) = self
            .tasks
            .transition_from(&task_id, TaskStatus::Queued, StatusChange::to(TaskStatus::Running))
            .await
        {
            debug!(task_id = %task_id, error = %e, "Task left the queue before it could start");
            lock(&self.running).remove(&task_id);
            return;
        }
        info!(task_id = %task_id, host_id = %host.id, kind = %host.kind(), "Task started");

        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(256);
        let store = self.tasks.clone();
        let drain_id = task_id.clone();
        let drain = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                if let Err(e) = store.append_log(&drain_id, line.stream, line.content).await {
                    warn!(task_id = %drain_id, error = %e, "Failed to append task output");
                }
            }
        });

        let transport = self.transports.transport_for(&host);
        let result = {
            let execute = transport.execute(&task, log_tx, token.clone());
            tokio::pin!(execute);
            tokio::select! {
                result = &mut execute => result,
                _ = token.cancelled() => {
                    match tokio::time::timeout(self.cancel_grace, &mut execute).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(
                                task_id = %task_id,
                                grace_secs = self.cancel_grace.as_secs_f64(),
                                "Transport did not stop within the grace period"
                            );
                            Err(TransportError::Cancelled)
                        }
                    }
                }
            }
        };

        if tokio::time::timeout(self.cancel_grace, drain).await.is_err() {
            warn!(task_id = %task_id, "Task output drain did not finish");
        }

        let change = if token.is_cancelled() {
            self.system_line(&task_id, "Task cancelled").await;
            StatusChange::to(TaskStatus::Cancelled)
        } else {
            match result {
                Ok(outcome) => match outcome.exit_code {
                    Some(code) if code != 0 => {
                        StatusChange::failed(FailureReason::NonZeroExit { exit_code: code })
                            .with_exit_code(Some(code))
                    }
                    exit_code => StatusChange::to(TaskStatus::Succeeded).with_exit_code(exit_code),
                },
                Err(TransportError::Unsupported(message)) => {
                    self.system_line(&task_id, &message).await;
                    StatusChange::failed(FailureReason::Unsupported { message })
                }
                Err(e) => {
                    let message = e.to_string();
                    self.system_line(&task_id, &message).await;
                    StatusChange::failed(FailureReason::Transport { message })
                }
            }
        };

        match self.tasks.transition(&task_id, change).await {
            Ok(done) => info!(
                task_id = %task_id,
                host_id = %host.id,
                status = %done.status,
                exit_code = ?done.exit_code,
                "Task finished"
            ),
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record task outcome"),
        }
        lock(&self.running).remove(&task_id);
    }

    /// A worker woken by cancellation before it got a slot.
    async fn finish_queued_cancel(&self, task_id: &TaskId) {
        let _ = self
            .tasks
            .transition_from(task_id, TaskStatus::Queued, StatusChange::to(TaskStatus::Cancelled))
            .await;
    }

    async fn system_line(&self, task_id: &TaskId, content: &str) {
        if let Err(e) = self
            .tasks
            .append_log(task_id, LogStream::System, content.to_string())
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to append system line");
        }
    }

    /// Cancel a queued or running task.
    ///
    /// A queued task is cancelled immediately. A running task is signalled
    /// and this waits until it stops or the grace period runs out.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task, OrchestratorError> {
        let task = self.get_task(task_id).await?;
        if task.is_terminal() {
            return Err(OrchestratorError::TaskNotCancellable {
                task_id: task_id.clone(),
                status: task.status,
            });
        }

        let handle = lock(&self.running).get(task_id).cloned();

        // The worker may have started the task since it was read; only a
        // task still queued in the store takes the direct path.
        if task.status == TaskStatus::Queued {
            if let Ok(cancelled) = self
                .tasks
                .transition_from(task_id, TaskStatus::Queued, StatusChange::to(TaskStatus::Cancelled))
                .await
            {
                if let Some(handle) = &handle {
                    handle.token.cancel();
                }
                info!(task_id = %task_id, "Queued task cancelled");
                return Ok(cancelled);
            }
        }

        let Some(mut handle) = handle else {
            let task = self.get_task(task_id).await?;
            if task.is_terminal() {
                return Err(OrchestratorError::TaskNotCancellable {
                    task_id: task_id.clone(),
                    status: task.status,
                });
            }
            return Ok(self
                .tasks
                .transition_from(task_id, task.status, StatusChange::to(TaskStatus::Cancelled))
                .await?);
        };

        info!(task_id = %task_id, "Cancelling running task");
        handle.token.cancel();
        let wait = self.cancel_grace + Duration::from_secs(1);
        let stopped = matches!(
            tokio::time::timeout(wait, handle.done.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        if !stopped {
            warn!(task_id = %task_id, "Task still stopping after the grace period");
        }

        self.get_task(task_id).await
    }

    /// Cancel every unfinished task on a host, then remove the host.
    pub async fn deregister_host(&self, host_id: &HostId) -> Result<Host, OrchestratorError> {
        self.registry.get(host_id).await?;

        // Queued first, so a freed slot is not handed to a doomed task.
        let mut active: Vec<Task> = self
            .tasks
            .list_tasks(Some(host_id))
            .await
            .into_iter()
            .filter(|t| !t.is_terminal())
            .collect();
        active.sort_by_key(|t| t.status != TaskStatus::Queued);

        for task in active {
            match self.cancel(&task.id).await {
                Ok(_) | Err(OrchestratorError::TaskNotCancellable { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let host = self.registry.delete(host_id).await?;
        lock(&self.slots).remove(host_id);
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use berth_core::{
        DeployMode, DockerInfo, HostSpec, SwarmMode, TaskPayload, TransportSpec,
    };
    use tokio::sync::Barrier;

    use crate::connection::{ExecOutcome, HostTransport, LogSink, ProbeReport, ReachabilityTable};
    use crate::detector::CapabilityDetector;
    use crate::store::MemoryStore;

    #[derive(Clone)]
    enum Behavior {
        Exit(i32),
        Sleep(Duration),
        Rendezvous(Arc<Barrier>),
        StreamThenWait(Vec<&'static str>),
        IgnoreCancel,
        Unreachable,
        Unsupported,
    }

    #[derive(Default)]
    struct Counters {
        executes: AtomicUsize,
        probes: AtomicUsize,
        per_host: Mutex<HashMap<HostId, (usize, usize)>>,
    }

    impl Counters {
        fn enter(&self, host_id: &HostId) {
            let mut map = lock(&self.per_host);
            let entry = map.entry(host_id.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }

        fn leave(&self, host_id: &HostId) {
            if let Some(entry) = lock(&self.per_host).get_mut(host_id) {
                entry.0 -= 1;
            }
        }

        fn max_overlap(&self, host_id: &HostId) -> usize {
            lock(&self.per_host).get(host_id).map_or(0, |e| e.1)
        }
    }

    struct FakeTransport {
        behavior: Behavior,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl HostTransport for FakeTransport {
        async fn probe(&self) -> Result<ProbeReport, TransportError> {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unreachable("fake".into()))
        }

        async fn execute(
            &self,
            task: &Task,
            log: LogSink,
            cancel: CancellationToken,
        ) -> Result<ExecOutcome, TransportError> {
            self.counters.executes.fetch_add(1, Ordering::SeqCst);
            self.counters.enter(&task.host_id);
            let result = match &self.behavior {
                Behavior::Exit(code) => {
                    let _ = log.send(LogLine::stdout("working")).await;
                    Ok(ExecOutcome::exited(*code))
                }
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(ExecOutcome::exited(0))
                }
                Behavior::Rendezvous(barrier) => {
                    match tokio::time::timeout(Duration::from_secs(2), barrier.wait()).await {
                        Ok(_) => Ok(ExecOutcome::exited(0)),
                        Err(_) => Err(TransportError::Remote("ran alone".into())),
                    }
                }
                Behavior::StreamThenWait(lines) => {
                    for line in lines {
                        let _ = log.send(LogLine::stdout(*line)).await;
                    }
                    cancel.cancelled().await;
                    Err(TransportError::Cancelled)
                }
                Behavior::IgnoreCancel => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ExecOutcome::exited(0))
                }
                Behavior::Unreachable => Err(TransportError::Unreachable("connection refused".into())),
                Behavior::Unsupported => Err(TransportError::Unsupported(
                    "build tasks are not supported over Portainer".into(),
                )),
            };
            self.counters.leave(&task.host_id);
            result
        }
    }

    struct FakeProvider {
        behavior: Behavior,
        counters: Arc<Counters>,
    }

    impl TransportProvider for FakeProvider {
        fn transport_for(&self, _host: &Host) -> Arc<dyn HostTransport> {
            Arc::new(FakeTransport {
                behavior: self.behavior.clone(),
                counters: self.counters.clone(),
            })
        }
    }

    struct Harness {
        orchestrator: Arc<TaskOrchestrator>,
        registry: Arc<HostRegistry>,
        detector: CapabilityDetector,
        counters: Arc<Counters>,
    }

    /// Task store whose reads and log appends can be scripted.
    struct ScriptedTasks {
        inner: Arc<MemoryStore>,
        report_queued: Mutex<Option<TaskId>>,
        fail_appends: AtomicBool,
    }

    impl ScriptedTasks {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                report_queued: Mutex::new(None),
                fail_appends: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TaskStore for ScriptedTasks {
        async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
            self.inner.insert_task(task).await
        }

        async fn get_task(&self, id: &TaskId) -> Option<Task> {
            let mut task = self.inner.get_task(id).await?;
            let mut report_queued = lock(&self.report_queued);
            if report_queued.as_ref() == Some(id) {
                *report_queued = None;
                task.status = TaskStatus::Queued;
            }
            Some(task)
        }

        async fn list_tasks(&self, host_id: Option<&HostId>) -> Vec<Task> {
            self.inner.list_tasks(host_id).await
        }

        async fn append_log(
            &self,
            id: &TaskId,
            stream: LogStream,
            content: String,
        ) -> Result<u64, StoreError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::TaskNotFound(id.clone()));
            }
            self.inner.append_log(id, stream, content).await
        }

        async fn transition(&self, id: &TaskId, change: StatusChange) -> Result<Task, StoreError> {
            self.inner.transition(id, change).await
        }

        async fn transition_from(
            &self,
            id: &TaskId,
            expected: TaskStatus,
            change: StatusChange,
        ) -> Result<Task, StoreError> {
            self.inner.transition_from(id, expected, change).await
        }
    }

    fn harness(behavior: Behavior, config: Config) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with_tasks(behavior, config, store.clone(), store)
    }

    fn harness_with_tasks(
        behavior: Behavior,
        config: Config,
        store: Arc<MemoryStore>,
        tasks: Arc<dyn TaskStore>,
    ) -> Harness {
        let registry = Arc::new(HostRegistry::new(store.clone(), store));
        let counters = Arc::new(Counters::default());
        let provider = Arc::new(FakeProvider {
            behavior,
            counters: counters.clone(),
        });
        let orchestrator = Arc::new(TaskOrchestrator::new(
            &config,
            registry.clone(),
            tasks,
            provider.clone(),
        ));
        let detector = CapabilityDetector::new(registry.clone(), provider, Arc::new(ReachabilityTable::new()));
        Harness {
            orchestrator,
            registry,
            detector,
            counters,
        }
    }

    impl Harness {
        async fn host(&self, name: &str, swarm: Option<SwarmMode>) -> HostId {
            let host = self
                .registry
                .create(HostSpec {
                    name: name.into(),
                    transport: TransportSpec::Agent { identity: None },
                })
                .await
                .unwrap()
                .host;
            if let Some(swarm_mode) = swarm {
                let info = DockerInfo {
                    compose_supported: true,
                    stack_supported: swarm_mode == SwarmMode::Active,
                    compose_version: Some("2.29.0".into()),
                    swarm_mode,
                };
                self.detector.record_agent_hello(&host.id, &info).await.unwrap();
            }
            host.id
        }
    }

    fn deploy(host_id: &HostId, mode: DeployMode) -> TaskSpec {
        TaskSpec::new(TaskCategory::Deploy, host_id.clone(), TaskPayload::script("./deploy.sh"))
            .with_mode(mode)
    }

    fn build(host_id: &HostId) -> TaskSpec {
        TaskSpec::new(TaskCategory::Build, host_id.clone(), TaskPayload::script("make"))
    }

    async fn wait_for_status(orchestrator: &TaskOrchestrator, id: &TaskId, status: TaskStatus) -> Task {
        for _ in 0..500 {
            let task = orchestrator.get_task(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }

    async fn wait_for_log_len(orchestrator: &TaskOrchestrator, id: &TaskId, len: usize) {
        for _ in 0..500 {
            if orchestrator.get_task(id).await.unwrap().log.len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never logged {len} lines");
    }

    #[tokio::test]
    async fn test_stack_deploy_without_swarm_never_touches_host() {
        let h = harness(Behavior::Exit(0), Config::default());
        let host_id = h.host("edge-1", Some(SwarmMode::Inactive)).await;

        let err = h
            .orchestrator
            .submit(deploy(&host_id, DeployMode::DockerStack))
            .await
            .unwrap_err();
        let OrchestratorError::CapabilityMismatch { task_id, reason } = err else {
            panic!("expected capability mismatch, got {err:?}");
        };
        assert!(reason.to_string().contains("Swarm mode is inactive"));

        let task = h.orchestrator.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(matches!(task.failure, Some(FailureReason::CapabilityMismatch { .. })));
        assert_eq!(task.log.len(), 1);
        assert_eq!(task.log[0].stream, LogStream::System);
        assert_eq!(h.counters.executes.load(Ordering::SeqCst), 0);
        assert_eq!(h.counters.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_of_task_started_after_read_waits_for_transport() {
        let store = Arc::new(MemoryStore::new());
        let tasks = Arc::new(ScriptedTasks::new(store.clone()));
        let h = harness_with_tasks(
            Behavior::StreamThenWait(vec!["pulling"]),
            Config::default(),
            store,
            tasks.clone(),
        );
        let host_id = h.host("edge-1", None).await;

        let task = h.orchestrator.submit(build(&host_id)).await.unwrap();
        wait_for_status(&h.orchestrator, &task.id, TaskStatus::Running).await;
        wait_for_log_len(&h.orchestrator, &task.id, 1).await;

        // Cancel sees the task as it was before the worker picked it up.
        *lock(&tasks.report_queued) = Some(task.id.clone());
        let cancelled = h.orchestrator.cancel(&task.id).await.unwrap();

        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let lines: Vec<&str> = cancelled.log.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(lines, ["pulling", "Task cancelled"]);
        assert_eq!(h.counters.executes.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.max_overlap(&host_id), 1);
        assert!(lock(&h.orchestrator.running).get(&task.id).is_none());
    }

    #[tokio::test]
    async fn test_mismatch_is_terminal_even_when_logging_fails() {
        let store = Arc::new(MemoryStore::new());
        let tasks = Arc::new(ScriptedTasks::new(store.clone()));
        let h = harness_with_tasks(Behavior::Exit(0), Config::default(), store, tasks.clone());
        let host_id = h.host("edge-1", Some(SwarmMode::Inactive)).await;

        tasks.fail_appends.store(true, Ordering::SeqCst);
        let err = h
            .orchestrator
            .submit(deploy(&host_id, DeployMode::DockerStack))
            .await
            .unwrap_err();
        let OrchestratorError::CapabilityMismatch { task_id, .. } = err else {
            panic!("expected capability mismatch, got {err:?}");
        };

        let task = h.orchestrator.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.log.is_empty());
        assert_eq!(h.counters.executes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_probed_host_rejects_deploys() {
        let h = harness(Behavior::Exit(0), Config::default());
        let host_id = h.host("fresh", None).await;

        let err = h
            .orchestrator
            .submit(deploy(&host_id, DeployMode::DockerCompose))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::CapabilityMismatch {
                reason: FailureReason::CapabilityMismatch {
                    gap: berth_core::CapabilityGap::NeverProbed,
                    ..
                },
                ..
            }
        ));
        assert_eq!(h.counters.executes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_on_unprobed_host_runs() {
        let h = harness(Behavior::Exit(0), Config::default());
        let host_id = h.host("fresh", None).await;

        let task = h.orchestrator.submit(build(&host_id)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        let done = wait_for_status(&h.orchestrator, &task.id, TaskStatus::Succeeded).await;
        assert_eq!(done.exit_code, Some(0));
        assert!(done.started_at.is_some());
        assert_eq!(done.log[0].content, "working");
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_task() {
        let h = harness(Behavior::Exit(3), Config::default());
        let host_id = h.host("edge", Some(SwarmMode::Active)).await;

        let task = h
            .orchestrator
            .submit(deploy(&host_id, DeployMode::DockerStack))
            .await
            .unwrap();
        let done = wait_for_status(&h.orchestrator, &task.id, TaskStatus::Failed).await;
        assert_eq!(done.failure, Some(FailureReason::NonZeroExit { exit_code: 3 }));
        assert_eq!(done.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_transport_error_fails_only_that_task() {
        let h = harness(Behavior::Unreachable, Config::default());
        let host_id = h.host("edge", None).await;

        let task = h.orchestrator.submit(build(&host_id)).await.unwrap();
        let done = wait_for_status(&h.orchestrator, &task.id, TaskStatus::Failed).await;
        assert!(matches!(done.failure, Some(FailureReason::Transport { .. })));
        let last = done.log.last().unwrap();
        assert_eq!(last.stream, LogStream::System);
        assert!(last.content.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unsupported_category_reason_is_plain() {
        let h = harness(Behavior::Unsupported, Config::default());
        let host_id = h.host("fleet", None).await;

        let task = h.orchestrator.submit(build(&host_id)).await.unwrap();
        let done = wait_for_status(&h.orchestrator, &task.id, TaskStatus::Failed).await;
        assert_eq!(
            done.failure.unwrap().to_string(),
            "build tasks are not supported over Portainer"
        );
    }

    #[tokio::test]
    async fn test_deploys_on_one_host_never_overlap() {
        let config = Config {
            per_host_concurrency: 2,
            ..Config::default()
        };
        let h = harness(Behavior::Sleep(Duration::from_millis(50)), config);
        let host_id = h.host("edge", Some(SwarmMode::Active)).await;

        let a = h.orchestrator.submit(deploy(&host_id, DeployMode::DockerCompose)).await.unwrap();
        let b = h.orchestrator.submit(deploy(&host_id, DeployMode::DockerStack)).await.unwrap();
        wait_for_status(&h.orchestrator, &a.id, TaskStatus::Succeeded).await;
        wait_for_status(&h.orchestrator, &b.id, TaskStatus::Succeeded).await;

        assert_eq!(h.counters.max_overlap(&host_id), 1);
    }

    #[tokio::test]
    async fn test_builds_respect_per_host_bound() {
        let h = harness(Behavior::Sleep(Duration::from_millis(30)), Config::default());
        let host_id = h.host("edge", None).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.orchestrator.submit(build(&host_id)).await.unwrap().id);
        }
        for id in &ids {
            wait_for_status(&h.orchestrator, id, TaskStatus::Succeeded).await;
        }
        assert_eq!(h.counters.max_overlap(&host_id), 1);
    }

    #[tokio::test]
    async fn test_different_hosts_run_in_parallel() {
        let barrier = Arc::new(Barrier::new(2));
        let h = harness(Behavior::Rendezvous(barrier), Config::default());
        let one = h.host("one", Some(SwarmMode::Inactive)).await;
        let two = h.host("two", Some(SwarmMode::Inactive)).await;

        let a = h.orchestrator.submit(deploy(&one, DeployMode::DockerCompose)).await.unwrap();
        let b = h.orchestrator.submit(deploy(&two, DeployMode::DockerCompose)).await.unwrap();

        wait_for_status(&h.orchestrator, &a.id, TaskStatus::Succeeded).await;
        wait_for_status(&h.orchestrator, &b.id, TaskStatus::Succeeded).await;
    }

    #[tokio::test]
    async fn test_queue_cap_rejects_with_host_busy() {
        let config = Config {
            max_queued_per_host: 1,
            ..Config::default()
        };
        let h = harness(Behavior::StreamThenWait(vec![]), config);
        let host_id = h.host("edge", None).await;
        let other = h.host("other", None).await;

        let first = h.orchestrator.submit(build(&host_id)).await.unwrap();
        let err = h.orchestrator.submit(build(&host_id)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::HostBusy { limit: 1, .. }));
        assert!(h.orchestrator.submit(build(&other)).await.is_ok());

        h.orchestrator.cancel(&first.id).await.unwrap();
        wait_for_status(&h.orchestrator, &first.id, TaskStatus::Cancelled).await;
        for _ in 0..100 {
            if h.orchestrator.submit(build(&host_id)).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slot was never released");
    }

    #[tokio::test]
    async fn test_cancel_queued_then_running() {
        let h = harness(Behavior::StreamThenWait(vec!["line 1", "line 2"]), Config::default());
        let host_id = h.host("edge", None).await;

        let running = h.orchestrator.submit(build(&host_id)).await.unwrap();
        wait_for_status(&h.orchestrator, &running.id, TaskStatus::Running).await;
        let queued = h.orchestrator.submit(build(&host_id)).await.unwrap();

        let cancelled = h.orchestrator.cancel(&queued.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.log.is_empty());
        assert!(cancelled.started_at.is_none());

        wait_for_log_len(&h.orchestrator, &running.id, 2).await;
        let stopped = h.orchestrator.cancel(&running.id).await.unwrap();
        assert_eq!(stopped.status, TaskStatus::Cancelled);
        let lines: Vec<_> = stopped.log.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(lines, ["line 1", "line 2", "Task cancelled"]);
        assert_eq!(stopped.log[2].stream, LogStream::System);
        assert_eq!(h.counters.executes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_fails() {
        let h = harness(Behavior::Exit(0), Config::default());
        let host_id = h.host("edge", None).await;
        let task = h.orchestrator.submit(build(&host_id)).await.unwrap();
        wait_for_status(&h.orchestrator, &task.id, TaskStatus::Succeeded).await;

        assert!(matches!(
            h.orchestrator.cancel(&task.id).await,
            Err(OrchestratorError::TaskNotCancellable {
                status: TaskStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_grace_bounds_stuck_transport() {
        let h = harness(Behavior::IgnoreCancel, Config::default());
        let host_id = h.host("edge", None).await;
        let task = h.orchestrator.submit(build(&host_id)).await.unwrap();
        wait_for_status(&h.orchestrator, &task.id, TaskStatus::Running).await;

        let started = tokio::time::Instant::now();
        let stopped = h.orchestrator.cancel(&task.id).await.unwrap();
        assert_eq!(stopped.status, TaskStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_deregister_cancels_active_tasks() {
        let h = harness(Behavior::StreamThenWait(vec!["booting"]), Config::default());
        let host_id = h.host("edge", None).await;
        let running = h.orchestrator.submit(build(&host_id)).await.unwrap();
        wait_for_status(&h.orchestrator, &running.id, TaskStatus::Running).await;
        let queued = h.orchestrator.submit(build(&host_id)).await.unwrap();

        h.orchestrator.deregister_host(&host_id).await.unwrap();

        assert!(h.registry.get(&host_id).await.is_err());
        for id in [&running.id, &queued.id] {
            assert_eq!(
                h.orchestrator.get_task(id).await.unwrap().status,
                TaskStatus::Cancelled
            );
        }
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let h = harness(Behavior::Exit(0), Config::default());
        let missing = h
            .orchestrator
            .submit(build(&HostId::new("nope")))
            .await
            .unwrap_err();
        assert!(matches!(missing, OrchestratorError::HostNotFound(_)));

        let host_id = h.host("edge", None).await;
        let spec = TaskSpec::new(TaskCategory::Deploy, host_id, TaskPayload::script("x"));
        assert!(matches!(
            h.orchestrator.submit(spec).await,
            Err(OrchestratorError::Invalid(_))
        ));
        assert!(h.orchestrator.list_tasks(None).await.is_empty());
    }
}
