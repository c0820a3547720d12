//! Berth Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network transports (WebSocket, SSH, HTTP clients)
//! - Storage
//! - Runtime specifics
//!
//! Hosts, capability snapshots, tasks, pipelines and the agent channel
//! frames shared by the control plane and the agent all live here.

pub mod capability;
pub mod error;
pub mod host;
pub mod ids;
pub mod pipeline;
pub mod protocol;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use capability::{
    CapabilityGap, CapabilitySnapshot, ComposeSupport, DeployMode, DockerInfo, ProbeTrigger,
    SwarmMode,
};
pub use error::CoreError;
pub use host::{
    AgentEndpoint, Host, HostKind, HostSpec, HostTransportConfig, PortainerEndpoint, SshAuth,
    SshEndpoint, TransportSpec,
};
pub use ids::{HostId, PipelineId, TaskId};
pub use pipeline::{Pipeline, PipelineSpec};
pub use status::TaskStatus;
pub use task::{
    FailureReason, LogChunk, LogStream, Task, TaskCategory, TaskOrigin, TaskPayload, TaskSpec,
};
