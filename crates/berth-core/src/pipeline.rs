//! Webhook-triggered build pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, HostId, PipelineId, TaskPayload};

/// A registered Git-triggered build template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,

    pub name: String,

    /// Host the build runs on.
    pub host_id: HostId,

    /// Unguessable URL path segment. Never the secret.
    pub webhook_token: String,

    /// Shared secret for signature/token verification.
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,

    /// Disabled pipelines reject every delivery.
    pub enabled: bool,

    /// Only pushes to this branch trigger a build, when set.
    pub branch: Option<String>,

    /// Build parameters handed to the task (opaque to the core).
    pub payload: TaskPayload,

    pub trigger_count: u64,

    pub last_triggered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Create a new Pipeline from a spec and a freshly generated token.
    pub fn new(spec: PipelineSpec, webhook_token: String) -> Self {
        Self {
            id: PipelineId::generate(),
            name: spec.name,
            host_id: spec.host_id,
            webhook_token,
            webhook_secret: spec.webhook_secret.filter(|s| !s.is_empty()),
            enabled: spec.enabled,
            branch: spec.branch.filter(|b| !b.is_empty()),
            payload: spec.payload,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether a push to `branch` should trigger this pipeline.
    pub fn accepts_branch(&self, branch: Option<&str>) -> bool {
        match (&self.branch, branch) {
            (None, _) => true,
            (Some(wanted), Some(pushed)) => wanted == pushed,
            (Some(_), None) => false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Registration request for a new Pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub host_id: HostId,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub branch: Option<String>,
    pub payload: TaskPayload,
}

impl PipelineSpec {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("pipeline name is required".into()));
        }
        if self.payload.script.trim().is_empty() {
            return Err(CoreError::InvalidInput("pipeline payload needs a script".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(branch: Option<&str>) -> PipelineSpec {
        PipelineSpec {
            name: "api".into(),
            host_id: HostId::new("h1"),
            webhook_secret: Some(String::new()),
            enabled: true,
            branch: branch.map(str::to_owned),
            payload: TaskPayload::script("docker build -t api ."),
        }
    }

    #[test]
    fn test_empty_secret_means_unverified() {
        let pipeline = Pipeline::new(spec(None), "tok".into());
        assert!(pipeline.webhook_secret.is_none());
    }

    #[test]
    fn test_branch_filter() {
        let any = Pipeline::new(spec(None), "a".into());
        assert!(any.accepts_branch(Some("dev")));
        assert!(any.accepts_branch(None));

        let main_only = Pipeline::new(spec(Some("main")), "b".into());
        assert!(main_only.accepts_branch(Some("main")));
        assert!(!main_only.accepts_branch(Some("dev")));
        assert!(!main_only.accepts_branch(None));
    }

    #[test]
    fn test_secret_never_serialized() {
        let mut s = spec(None);
        s.webhook_secret = Some("shh".into());
        let pipeline = Pipeline::new(s, "tok".into());
        let json = serde_json::to_string(&pipeline).unwrap();
        assert!(!json.contains("shh"));
    }
}
