//! Berth Control Plane Library
//!
//! Host registry, capability detection, the agent/SSH/Portainer
//! transports, task orchestration and webhook-triggered pipelines.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod detector;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod store;
pub mod webhook;

pub use config::Config;
pub use connection::{ConnectionManager, HostTransport, TransportError, TransportProvider};
pub use detector::CapabilityDetector;
pub use orchestrator::{OrchestratorError, TaskOrchestrator};
pub use registry::{HostRegistry, RegistryError};
pub use state::AppState;
pub use store::MemoryStore;
pub use webhook::{WebhookOutcome, WebhookRejection, WebhookRouter};
