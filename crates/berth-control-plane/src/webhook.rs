//! Webhook-triggered build pipelines.
//!
//! A delivery is matched to a pipeline by the token in its URL path. When
//! the pipeline has a secret, the delivery must carry a valid GitHub
//! signature or a GitLab/Gitee token; all secret comparisons are constant
//! time. Accepted pushes submit a build task on the pipeline's host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use berth_core::{
    Pipeline, PipelineSpec, TaskCategory, TaskId, TaskOrigin, TaskPayload, TaskSpec,
};

use crate::crypto::{constant_time_eq, generate_token};
use crate::orchestrator::{OrchestratorError, TaskOrchestrator};
use crate::registry::HostRegistry;
use crate::store::{PipelineStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

const GITHUB_SIGNATURE: &str = "x-hub-signature-256";
const GITHUB_EVENT: &str = "x-github-event";
const GITLAB_TOKEN: &str = "x-gitlab-token";
const GITLAB_EVENT: &str = "x-gitlab-event";
const GITEE_TOKEN: &str = "x-gitee-token";
const GITEE_EVENT: &str = "x-gitee-event";

/// Why a delivery was refused.
#[derive(Debug, Error)]
pub enum WebhookRejection {
    #[error("pipeline not found")]
    NotFound,

    #[error("pipeline is disabled")]
    Forbidden,

    #[error("webhook verification failed")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Submit(#[from] OrchestratorError),
}

/// What happened to an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Accepted { task_id: TaskId },
    Ignored { reason: String },
}

/// Pipeline errors outside of deliveries.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Invalid(String),

    #[error("Host not found: {0}")]
    HostNotFound(berth_core::HostId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    GitHub,
    GitLab,
    Gitee,
}

impl Platform {
    fn detect(headers: &HeaderMap) -> Option<Self> {
        if headers.contains_key(GITHUB_SIGNATURE) || headers.contains_key(GITHUB_EVENT) {
            Some(Self::GitHub)
        } else if headers.contains_key(GITLAB_TOKEN) || headers.contains_key(GITLAB_EVENT) {
            Some(Self::GitLab)
        } else if headers.contains_key(GITEE_TOKEN) || headers.contains_key(GITEE_EVENT) {
            Some(Self::Gitee)
        } else {
            None
        }
    }

    fn event_header(self) -> &'static str {
        match self {
            Self::GitHub => GITHUB_EVENT,
            Self::GitLab => GITLAB_EVENT,
            Self::Gitee => GITEE_EVENT,
        }
    }

    fn is_push(self, event: &str) -> bool {
        match self {
            Self::GitHub => event == "push",
            Self::GitLab | Self::Gitee => event == "Push Hook",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Gitee => "gitee",
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn verify_github_signature(signature: &str, secret: &str, body: &[u8]) -> bool {
    let Some(hex_part) = signature.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

fn verify(platform: Option<Platform>, headers: &HeaderMap, secret: &str, body: &[u8]) -> bool {
    match platform {
        Some(Platform::GitHub) => header(headers, GITHUB_SIGNATURE)
            .is_some_and(|sig| verify_github_signature(sig, secret, body)),
        Some(Platform::GitLab) => header(headers, GITLAB_TOKEN)
            .is_some_and(|token| constant_time_eq(token.as_bytes(), secret.as_bytes())),
        Some(Platform::Gitee) => header(headers, GITEE_TOKEN)
            .is_some_and(|token| constant_time_eq(token.as_bytes(), secret.as_bytes())),
        None => false,
    }
}

#[derive(Debug, Default, Deserialize)]
struct Repository {
    clone_url: Option<String>,
    git_http_url: Option<String>,
    url: Option<String>,
}

impl Repository {
    fn clone_url(&self) -> Option<&str> {
        self.clone_url
            .as_deref()
            .or(self.git_http_url.as_deref())
            .or(self.url.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    repository: Option<Repository>,
    #[serde(default)]
    project: Option<Repository>,
}

/// The parts of a push event a build needs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PushInfo {
    git_ref: String,
    branch: Option<String>,
    clone_url: Option<String>,
}

fn parse_push(body: &[u8]) -> Result<PushInfo, WebhookRejection> {
    let event: PushEvent = serde_json::from_slice(body)
        .map_err(|e| WebhookRejection::BadRequest(format!("invalid push payload: {e}")))?;

    let git_ref = event
        .git_ref
        .filter(|r| !r.is_empty())
        .ok_or_else(|| WebhookRejection::BadRequest("push payload has no ref".into()))?;
    let branch = git_ref.strip_prefix("refs/heads/").map(str::to_owned);
    let clone_url = event
        .repository
        .as_ref()
        .and_then(Repository::clone_url)
        .or_else(|| event.project.as_ref().and_then(Repository::clone_url))
        .map(str::to_owned);

    Ok(PushInfo {
        git_ref,
        branch,
        clone_url,
    })
}

fn build_payload(pipeline: &Pipeline, push: &PushInfo) -> TaskPayload {
    let mut payload = pipeline
        .payload
        .clone()
        .with_env("BERTH_GIT_REF", &push.git_ref)
        .with_env("BERTH_PIPELINE_ID", pipeline.id.as_str());
    if let Some(branch) = &push.branch {
        payload = payload.with_env("BERTH_GIT_BRANCH", branch);
    }
    if let Some(url) = &push.clone_url {
        payload = payload.with_env("BERTH_GIT_URL", url);
    }
    payload
}

/// Delivery counters by outcome.
#[derive(Debug, Default)]
pub struct WebhookStats {
    pub accepted: AtomicU64,
    pub ignored: AtomicU64,
    pub rejected: AtomicU64,
}

/// Routes deliveries to pipelines.
pub struct WebhookRouter {
    pipelines: Arc<dyn PipelineStore>,
    registry: Arc<HostRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    stats: WebhookStats,
}

impl WebhookRouter {
    pub fn new(
        pipelines: Arc<dyn PipelineStore>,
        registry: Arc<HostRegistry>,
        orchestrator: Arc<TaskOrchestrator>,
    ) -> Self {
        Self {
            pipelines,
            registry,
            orchestrator,
            stats: WebhookStats::default(),
        }
    }

    pub fn stats(&self) -> &WebhookStats {
        &self.stats
    }

    /// Register a pipeline with a fresh webhook token.
    pub async fn create_pipeline(&self, spec: PipelineSpec) -> Result<Pipeline, PipelineError> {
        spec.validate()
            .map_err(|e| PipelineError::Invalid(e.to_string()))?;
        if self.registry.get(&spec.host_id).await.is_err() {
            return Err(PipelineError::HostNotFound(spec.host_id));
        }

        let (webhook_token, _) = generate_token();
        let pipeline = Pipeline::new(spec, webhook_token);
        self.pipelines.insert_pipeline(pipeline.clone()).await?;

        info!(
            pipeline_id = %pipeline.id,
            name = %pipeline.name,
            host_id = %pipeline.host_id,
            verified = pipeline.webhook_secret.is_some(),
            "Pipeline registered"
        );
        Ok(pipeline)
    }

    pub async fn list_pipelines(&self) -> Vec<Pipeline> {
        self.pipelines.list_pipelines().await
    }

    /// Handle one delivery.
    pub async fn handle(
        &self,
        webhook_token: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookRejection> {
        let result = self.dispatch(webhook_token, headers, body).await;
        let counter = match &result {
            Ok(WebhookOutcome::Accepted { .. }) => &self.stats.accepted,
            Ok(WebhookOutcome::Ignored { .. }) => &self.stats.ignored,
            Err(_) => &self.stats.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn dispatch(
        &self,
        webhook_token: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookRejection> {
        let pipeline = self
            .pipelines
            .find_by_token(webhook_token)
            .await
            .ok_or(WebhookRejection::NotFound)?;

        if !pipeline.enabled {
            info!(pipeline_id = %pipeline.id, "Delivery for disabled pipeline refused");
            return Err(WebhookRejection::Forbidden);
        }

        let platform = Platform::detect(headers);
        if let Some(secret) = &pipeline.webhook_secret {
            if !verify(platform, headers, secret, body) {
                warn!(
                    pipeline_id = %pipeline.id,
                    platform = platform.map_or("unknown", Platform::as_str),
                    "Webhook verification failed"
                );
                return Err(WebhookRejection::Unauthorized);
            }
        }

        if let Some(platform) = platform {
            if let Some(event) = header(headers, platform.event_header()) {
                if !platform.is_push(event) {
                    return Ok(WebhookOutcome::Ignored {
                        reason: format!("{} event \"{event}\" is not a push", platform.as_str()),
                    });
                }
            }
        }

        let push = parse_push(body)?;
        if !pipeline.accepts_branch(push.branch.as_deref()) {
            return Ok(WebhookOutcome::Ignored {
                reason: format!(
                    "ref {} does not match branch filter {}",
                    push.git_ref,
                    pipeline.branch.as_deref().unwrap_or_default()
                ),
            });
        }

        let spec = TaskSpec::new(
            TaskCategory::Build,
            pipeline.host_id.clone(),
            build_payload(&pipeline, &push),
        )
        .with_origin(TaskOrigin::Pipeline {
            pipeline_id: pipeline.id.clone(),
        });
        let task = self.orchestrator.submit(spec).await?;

        if let Err(e) = self.pipelines.record_trigger(&pipeline.id, Utc::now()).await {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to record pipeline trigger");
        }

        info!(
            pipeline_id = %pipeline.id,
            task_id = %task.id,
            git_ref = %push.git_ref,
            "Pipeline triggered"
        );
        Ok(WebhookOutcome::Accepted { task_id: task.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use berth_core::{Host, HostSpec, Task, TransportSpec};
    use tokio_util::sync::CancellationToken;

    use crate::config::Config;
    use crate::connection::{
        ExecOutcome, HostTransport, LogSink, ProbeReport, TransportError, TransportProvider,
    };
    use crate::store::{MemoryStore, TaskStore};

    struct InstantTransport;

    #[async_trait]
    impl HostTransport for InstantTransport {
        async fn probe(&self) -> Result<ProbeReport, TransportError> {
            Err(TransportError::Unreachable("not probed in tests".into()))
        }

        async fn execute(&self, _: &Task, _: LogSink, _: CancellationToken) -> Result<ExecOutcome, TransportError> {
            Ok(ExecOutcome::exited(0))
        }
    }

    struct InstantProvider;

    impl TransportProvider for InstantProvider {
        fn transport_for(&self, _host: &Host) -> Arc<dyn HostTransport> {
            Arc::new(InstantTransport)
        }
    }

    const PUSH: &str = r#"{
        "ref": "refs/heads/main",
        "repository": {"clone_url": "https://github.com/acme/api.git"}
    }"#;

    struct Fixture {
        router: WebhookRouter,
        store: Arc<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(HostRegistry::new(store.clone(), store.clone()));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            &Config::default(),
            registry.clone(),
            store.clone(),
            Arc::new(InstantProvider),
        ));
        registry
            .create(HostSpec {
                name: "builder".into(),
                transport: TransportSpec::Agent { identity: None },
            })
            .await
            .unwrap();
        Fixture {
            router: WebhookRouter::new(store.clone(), registry, orchestrator),
            store,
        }
    }

    impl Fixture {
        async fn pipeline(&self, secret: Option<&str>, branch: Option<&str>, enabled: bool) -> Pipeline {
            let host_id = self.router.registry.list().await[0].id.clone();
            self.router
                .create_pipeline(PipelineSpec {
                    name: "api".into(),
                    host_id,
                    webhook_secret: secret.map(str::to_owned),
                    enabled,
                    branch: branch.map(str::to_owned),
                    payload: TaskPayload::script("docker build -t api ."),
                })
                .await
                .unwrap()
        }

        async fn trigger_count(&self, pipeline: &Pipeline) -> u64 {
            self.store
                .find_by_token(&pipeline.webhook_token)
                .await
                .unwrap()
                .trigger_count
        }
    }

    fn github_headers(secret: &str, body: &[u8]) -> HeaderMap {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let mut headers = HeaderMap::new();
        headers.insert(GITHUB_EVENT, HeaderValue::from_static("push"));
        headers.insert(GITHUB_SIGNATURE, HeaderValue::from_str(&signature).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_github_signature_accepted() {
        let f = fixture().await;
        let pipeline = f.pipeline(Some("s3cret"), None, true).await;

        let outcome = f
            .router
            .handle(&pipeline.webhook_token, &github_headers("s3cret", PUSH.as_bytes()), PUSH.as_bytes())
            .await
            .unwrap();
        let WebhookOutcome::Accepted { task_id } = outcome else {
            panic!("expected accepted, got {outcome:?}");
        };

        let task = f.store.get_task(&task_id).await.unwrap();
        assert_eq!(task.category, TaskCategory::Build);
        assert_eq!(task.payload.env["BERTH_GIT_REF"], "refs/heads/main");
        assert_eq!(task.payload.env["BERTH_GIT_BRANCH"], "main");
        assert_eq!(task.payload.env["BERTH_GIT_URL"], "https://github.com/acme/api.git");
        assert_eq!(task.payload.env["BERTH_PIPELINE_ID"], pipeline.id.as_str());
        assert_eq!(
            task.origin,
            TaskOrigin::Pipeline {
                pipeline_id: pipeline.id.clone()
            }
        );
        assert_eq!(f.trigger_count(&pipeline).await, 1);
        assert_eq!(f.router.stats().accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_flipped_signature_byte_rejected() {
        let f = fixture().await;
        let pipeline = f.pipeline(Some("s3cret"), None, true).await;

        let mut headers = github_headers("s3cret", PUSH.as_bytes());
        let sig = header(&headers, GITHUB_SIGNATURE).unwrap().to_string();
        let last = sig.chars().last().unwrap();
        let flipped = format!("{}{}", &sig[..sig.len() - 1], if last == '0' { '1' } else { '0' });
        headers.insert(GITHUB_SIGNATURE, HeaderValue::from_str(&flipped).unwrap());

        let err = f
            .router
            .handle(&pipeline.webhook_token, &headers, PUSH.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookRejection::Unauthorized));
        assert_eq!(f.trigger_count(&pipeline).await, 0);
        assert!(f.store.list_tasks(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_rejected_when_secret_set() {
        let f = fixture().await;
        let pipeline = f.pipeline(Some("s3cret"), None, true).await;

        let err = f
            .router
            .handle(&pipeline.webhook_token, &HeaderMap::new(), PUSH.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookRejection::Unauthorized));
    }

    #[tokio::test]
    async fn test_gitlab_and_gitee_tokens() {
        let f = fixture().await;
        let pipeline = f.pipeline(Some("tok"), None, true).await;
        let body = br#"{"ref":"refs/heads/dev","project":{"git_http_url":"https://gitlab.example.com/acme/api.git"}}"#;

        let mut gitlab = HeaderMap::new();
        gitlab.insert(GITLAB_EVENT, HeaderValue::from_static("Push Hook"));
        gitlab.insert(GITLAB_TOKEN, HeaderValue::from_static("tok"));
        let outcome = f.router.handle(&pipeline.webhook_token, &gitlab, body).await.unwrap();
        let WebhookOutcome::Accepted { task_id } = outcome else {
            panic!("expected accepted, got {outcome:?}");
        };
        let task = f.store.get_task(&task_id).await.unwrap();
        assert_eq!(
            task.payload.env["BERTH_GIT_URL"],
            "https://gitlab.example.com/acme/api.git"
        );

        let mut gitee = HeaderMap::new();
        gitee.insert(GITEE_TOKEN, HeaderValue::from_static("nope"));
        assert!(matches!(
            f.router.handle(&pipeline.webhook_token, &gitee, body).await,
            Err(WebhookRejection::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_pipelines() {
        let f = fixture().await;
        assert!(matches!(
            f.router.handle("missing", &HeaderMap::new(), PUSH.as_bytes()).await,
            Err(WebhookRejection::NotFound)
        ));

        let disabled = f.pipeline(None, None, false).await;
        assert!(matches!(
            f.router
                .handle(&disabled.webhook_token, &HeaderMap::new(), PUSH.as_bytes())
                .await,
            Err(WebhookRejection::Forbidden)
        ));
        assert_eq!(f.trigger_count(&disabled).await, 0);
        assert_eq!(f.router.stats().rejected.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_branch_filter_ignores_other_branches() {
        let f = fixture().await;
        let pipeline = f.pipeline(None, Some("release"), true).await;

        let outcome = f
            .router
            .handle(&pipeline.webhook_token, &HeaderMap::new(), PUSH.as_bytes())
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(f.trigger_count(&pipeline).await, 0);
        assert!(f.store.list_tasks(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_push_events_ignored() {
        let f = fixture().await;
        let pipeline = f.pipeline(None, None, true).await;
        let mut headers = HeaderMap::new();
        headers.insert(GITHUB_EVENT, HeaderValue::from_static("ping"));

        let outcome = f
            .router
            .handle(&pipeline.webhook_token, &headers, br#"{"zen":"hi"}"#)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let f = fixture().await;
        let pipeline = f.pipeline(None, None, true).await;

        assert!(matches!(
            f.router.handle(&pipeline.webhook_token, &HeaderMap::new(), b"not json").await,
            Err(WebhookRejection::BadRequest(_))
        ));
        assert!(matches!(
            f.router.handle(&pipeline.webhook_token, &HeaderMap::new(), b"{}").await,
            Err(WebhookRejection::BadRequest(_))
        ));
    }

    #[test]
    fn test_tag_push_has_no_branch() {
        let push = parse_push(br#"{"ref":"refs/tags/v1.0.0","repository":{"url":"git@x:y.git"}}"#).unwrap();
        assert_eq!(push.branch, None);
        assert_eq!(push.clone_url.as_deref(), Some("git@x:y.git"));
    }
}
