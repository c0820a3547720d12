//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::connection::{ConnectionManager, TransportProvider};
use crate::detector::CapabilityDetector;
use crate::orchestrator::TaskOrchestrator;
use crate::registry::HostRegistry;
use crate::store::MemoryStore;
use crate::webhook::WebhookRouter;

/// Shared application state.
pub struct AppState {
    pub config: Config,

    /// Host, task and pipeline records.
    pub store: Arc<MemoryStore>,

    pub registry: Arc<HostRegistry>,

    /// Agent channels and per-host reachability.
    pub connections: Arc<ConnectionManager>,

    pub detector: Arc<CapabilityDetector>,

    pub orchestrator: Arc<TaskOrchestrator>,

    pub webhooks: WebhookRouter,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(config: Config) -> Result<Arc<Self>, reqwest::Error> {
        let connections = Arc::new(ConnectionManager::new(&config)?);
        let transports: Arc<dyn TransportProvider> = connections.clone();
        Ok(Self::with_transports(config, connections, transports))
    }

    /// Create a new AppState whose detector and orchestrator reach hosts
    /// through `transports`.
    pub fn with_transports(
        config: Config,
        connections: Arc<ConnectionManager>,
        transports: Arc<dyn TransportProvider>,
    ) -> Arc<Self> {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(HostRegistry::new(store.clone(), store.clone()));
        let detector = Arc::new(CapabilityDetector::new(
            registry.clone(),
            transports.clone(),
            connections.reachability().clone(),
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            &config,
            registry.clone(),
            store.clone(),
            transports,
        ));
        let webhooks = WebhookRouter::new(store.clone(), registry.clone(), orchestrator.clone());

        Arc::new(Self {
            config,
            store,
            registry,
            connections,
            detector,
            orchestrator,
            webhooks,
        })
    }
}
