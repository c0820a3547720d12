//! Capability detection.
//!
//! Snapshots are produced at exactly three moments: an agent's hello, an
//! operator's connection test, and an operator's manual refresh. Nothing
//! probes on a timer. This module is also the only place that can mint a
//! [`CapabilityWrite`], which [`HostRegistry::update_capabilities`]
//! requires, so no other code path can overwrite a host's snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use berth_core::{CapabilitySnapshot, ComposeSupport, DockerInfo, Host, HostId, HostKind, ProbeTrigger, SwarmMode};

use crate::connection::{ProbeReport, ReachabilityTable, TransportError, TransportProvider};
use crate::registry::{HostRegistry, RegistryError};

/// Proof that a capability write comes from the detector.
pub struct CapabilityWrite {
    _private: (),
}

impl CapabilityWrite {
    fn new() -> Self {
        Self { _private: () }
    }
}

/// A single capability check failed. Never leaves this module's callers
/// as an error: it only degrades the affected field.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("check timed out after {0:?}")]
    Timeout(Duration),

    #[error("check failed: {0}")]
    CommandFailed(String),
}

/// Detection errors.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    WrongKind(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),
}

/// Produces and stores capability snapshots.
pub struct CapabilityDetector {
    registry: Arc<HostRegistry>,
    transports: Arc<dyn TransportProvider>,
    reachability: Arc<ReachabilityTable>,
    probe_locks: Mutex<HashMap<HostId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CapabilityDetector {
    pub fn new(
        registry: Arc<HostRegistry>,
        transports: Arc<dyn TransportProvider>,
        reachability: Arc<ReachabilityTable>,
    ) -> Self {
        Self {
            registry,
            transports,
            reachability,
            probe_locks: Mutex::new(HashMap::new()),
        }
    }

    fn probe_lock(&self, host_id: &HostId) -> Arc<tokio::sync::Mutex<()>> {
        self.probe_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host_id.clone())
            .or_default()
            .clone()
    }

    /// Drop the probe lock of a deregistered host.
    pub fn forget(&self, host_id: &HostId) {
        self.probe_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host_id);
    }

    /// Record the capabilities an agent reported in its hello.
    pub async fn record_agent_hello(
        &self,
        host_id: &HostId,
        info: &DockerInfo,
    ) -> Result<CapabilitySnapshot, DetectError> {
        let lock = self.probe_lock(host_id);
        let _guard = lock.lock().await;

        let snapshot = CapabilitySnapshot::from_docker_info(info, ProbeTrigger::AgentHello);
        self.registry
            .update_capabilities(host_id, snapshot.clone(), CapabilityWrite::new())
            .await?;

        info!(
            host_id = %host_id,
            compose = snapshot.compose().is_available(),
            swarm_mode = %snapshot.swarm_mode(),
            "Capabilities recorded from agent hello"
        );
        Ok(snapshot)
    }

    /// Operator-initiated connection test of an SSH or Portainer host.
    pub async fn connection_test(&self, host_id: &HostId) -> Result<CapabilitySnapshot, DetectError> {
        let host = self.registry.get(host_id).await?;
        if host.kind() == HostKind::Agent {
            return Err(DetectError::WrongKind(
                "agent hosts report capabilities when they connect; use refresh instead".into(),
            ));
        }
        self.probe(&host, ProbeTrigger::ConnectionTest).await
    }

    /// Operator-initiated refresh of any host.
    pub async fn refresh(&self, host_id: &HostId) -> Result<CapabilitySnapshot, DetectError> {
        let host = self.registry.get(host_id).await?;
        self.probe(&host, ProbeTrigger::ManualRefresh).await
    }

    async fn probe(&self, host: &Host, trigger: ProbeTrigger) -> Result<CapabilitySnapshot, DetectError> {
        let lock = self.probe_lock(&host.id);
        let _guard = lock.lock().await;

        let transport = self.transports.transport_for(host);
        let report = match transport.probe().await {
            Ok(report) => report,
            Err(e) => {
                warn!(host_id = %host.id, kind = %host.kind(), error = %e, "Probe failed, keeping previous snapshot");
                if host.kind() != HostKind::Agent {
                    self.reachability.mark_unreachable(&host.id).await;
                }
                return Err(match e {
                    TransportError::Unreachable(m) => DetectError::Unreachable(m),
                    other => DetectError::Unreachable(other.to_string()),
                });
            }
        };

        if host.kind() != HostKind::Agent {
            self.reachability.mark_connected(&host.id).await;
        }

        let snapshot = snapshot_from_report(&host.id, report, trigger);
        self.registry
            .update_capabilities(&host.id, snapshot.clone(), CapabilityWrite::new())
            .await?;

        info!(
            host_id = %host.id,
            kind = %host.kind(),
            trigger = ?trigger,
            compose = ?snapshot.compose(),
            swarm_mode = %snapshot.swarm_mode(),
            "Capabilities detected"
        );
        Ok(snapshot)
    }
}

/// Degrade failed checks to their "not available" values.
fn snapshot_from_report(host_id: &HostId, report: ProbeReport, trigger: ProbeTrigger) -> CapabilitySnapshot {
    let compose = report.compose.unwrap_or_else(|e| {
        warn!(host_id = %host_id, error = %e, "Compose check failed");
        ComposeSupport::Unavailable
    });
    let swarm_mode = report.swarm_mode.unwrap_or_else(|e| {
        warn!(host_id = %host_id, error = %e, "Swarm check failed");
        SwarmMode::Unknown
    });
    CapabilitySnapshot::new(compose, swarm_mode, trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use berth_core::{HostSpec, SshAuth, SshEndpoint, Task, TransportSpec};
    use tokio_util::sync::CancellationToken;

    use crate::connection::{ExecOutcome, HostTransport, LogSink};
    use crate::store::MemoryStore;

    type ProbeFn = dyn Fn() -> Result<ProbeReport, TransportError> + Send + Sync;

    struct ScriptedTransport {
        probe: Arc<ProbeFn>,
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HostTransport for ScriptedTransport {
        async fn probe(&self) -> Result<ProbeReport, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.probe)()
        }

        async fn execute(&self, _: &Task, _: LogSink, _: CancellationToken) -> Result<ExecOutcome, TransportError> {
            unreachable!("detector never executes tasks")
        }
    }

    struct ScriptedProvider {
        probe: Arc<ProbeFn>,
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl ScriptedProvider {
        fn new(probe: impl Fn() -> Result<ProbeReport, TransportError> + Send + Sync + 'static) -> Self {
            Self {
                probe: Arc::new(probe),
                calls: Arc::new(AtomicUsize::new(0)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl TransportProvider for ScriptedProvider {
        fn transport_for(&self, _host: &Host) -> Arc<dyn HostTransport> {
            Arc::new(ScriptedTransport {
                probe: self.probe.clone(),
                calls: self.calls.clone(),
                in_flight: self.in_flight.clone(),
                max_in_flight: self.max_in_flight.clone(),
            })
        }
    }

    fn ssh_spec() -> HostSpec {
        HostSpec {
            name: "builder".into(),
            transport: TransportSpec::Ssh(SshEndpoint {
                address: "10.0.0.5".into(),
                port: 22,
                username: "deploy".into(),
                auth: SshAuth::Password {
                    password: "pw".into(),
                },
                trust_on_first_use: false,
                known_hosts_path: None,
            }),
        }
    }

    async fn setup(provider: Arc<ScriptedProvider>) -> (CapabilityDetector, Arc<HostRegistry>, HostId) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(HostRegistry::new(store.clone(), store));
        let host = registry.create(ssh_spec()).await.unwrap().host;
        let detector = CapabilityDetector::new(registry.clone(), provider, Arc::new(ReachabilityTable::new()));
        (detector, registry, host.id)
    }

    #[tokio::test]
    async fn test_partial_failure_degrades_only_failed_field() {
        let provider = Arc::new(ScriptedProvider::new(|| {
            Ok(ProbeReport {
                compose: Ok(ComposeSupport::Available {
                    version: Some("2.24.0".into()),
                }),
                swarm_mode: Err(ProbeError::Timeout(Duration::from_secs(5))),
            })
        }));
        let (detector, registry, id) = setup(provider).await;

        let snapshot = detector.connection_test(&id).await.unwrap();
        assert_eq!(snapshot.compose().version(), Some("2.24.0"));
        assert_eq!(snapshot.swarm_mode(), SwarmMode::Unknown);
        assert!(!snapshot.stack_supported());
        assert_eq!(snapshot.trigger(), ProbeTrigger::ConnectionTest);
        assert_eq!(registry.get(&id).await.unwrap().capabilities, Some(snapshot));
    }

    #[tokio::test]
    async fn test_unreachable_keeps_previous_snapshot() {
        let reachable = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = reachable.clone();
        let provider = Arc::new(ScriptedProvider::new(move || {
            if flag.load(Ordering::SeqCst) {
                Ok(ProbeReport {
                    compose: Ok(ComposeSupport::Available { version: None }),
                    swarm_mode: Ok(SwarmMode::Active),
                })
            } else {
                Err(TransportError::Unreachable("connection refused".into()))
            }
        }));
        let (detector, registry, id) = setup(provider).await;

        let first = detector.connection_test(&id).await.unwrap();
        reachable.store(false, Ordering::SeqCst);
        let err = detector.refresh(&id).await.unwrap_err();
        assert!(matches!(err, DetectError::Unreachable(_)));
        assert_eq!(registry.get(&id).await.unwrap().capabilities, Some(first));
    }

    #[tokio::test]
    async fn test_concurrent_probes_serialize_per_host() {
        let provider = Arc::new(ScriptedProvider::new(|| {
            Ok(ProbeReport {
                compose: Ok(ComposeSupport::Unknown),
                swarm_mode: Ok(SwarmMode::Inactive),
            })
        }));
        let (detector, _registry, id) = setup(provider.clone()).await;
        let detector = Arc::new(detector);

        let a = {
            let (d, id) = (detector.clone(), id.clone());
            tokio::spawn(async move { d.refresh(&id).await })
        };
        let b = {
            let (d, id) = (detector.clone(), id.clone());
            tokio::spawn(async move { d.refresh(&id).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_test_rejects_agent_hosts() {
        let provider = Arc::new(ScriptedProvider::new(|| unreachable!()));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(HostRegistry::new(store.clone(), store));
        let host = registry
            .create(HostSpec {
                name: "edge".into(),
                transport: TransportSpec::Agent { identity: None },
            })
            .await
            .unwrap()
            .host;
        let detector = CapabilityDetector::new(registry, provider.clone(), Arc::new(ReachabilityTable::new()));

        assert!(matches!(
            detector.connection_test(&host.id).await,
            Err(DetectError::WrongKind(_))
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_agent_hello_ignores_claimed_stack_support() {
        let provider = Arc::new(ScriptedProvider::new(|| unreachable!()));
        let (detector, registry, id) = setup(provider).await;

        let info = DockerInfo {
            compose_supported: true,
            stack_supported: true,
            compose_version: None,
            swarm_mode: SwarmMode::Inactive,
        };
        detector.record_agent_hello(&id, &info).await.unwrap();

        let stored = registry.get(&id).await.unwrap().capabilities.unwrap();
        assert!(!stored.stack_supported());
        assert_eq!(stored.trigger(), ProbeTrigger::AgentHello);
    }
}
