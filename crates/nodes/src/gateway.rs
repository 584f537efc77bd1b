//! The resilience layer wrapping every compute resource call.
//!
//! [`invoke`] runs one request against one initialised resource with bounded
//! attempts, a timeout per attempt and exponential backoff. [`StageGateway`]
//! adds resource selection on top: it initialises the stage's primary
//! resource, switches to the stage's alternate when the primary cannot be
//! initialised or exhausts its attempts, and remembers the switch for the rest
//! of the stage's execution.

use std::sync::Arc;
use std::time::Duration;

use pipeline::{
    Completion, CompletionRequest, LlmError, LlmProvider, ResourceCatalog, ResourceConnector,
    ResourceDescriptor, ResourceId, ResourceRole, ResourceUsage, RetryPolicy, RetrySettings,
    StageFailure, StageName,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Policy and failures
// ---------------------------------------------------------------------------

/// Attempt, timeout and backoff bounds for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokePolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for InvokePolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for InvokePolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            per_attempt_timeout: settings.per_attempt_timeout(),
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
        }
    }
}

impl InvokePolicy {
    /// Delay before attempt `attempt + 1`, given that attempt `attempt`
    /// (1-based) failed with `error`.
    pub fn backoff(&self, attempt: u32, error: &LlmError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let computed = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        match error.retry_policy() {
            RetryPolicy::Retryable { after: Some(after) } => computed.max(after),
            _ => computed,
        }
    }
}

/// Structured failure of the resilience layer. Callers decide whether it is
/// fatal to their stage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvocationFailure {
    #[error("invocation cancelled")]
    Cancelled,

    #[error("stage '{stage}' has no compute resource assigned")]
    NoResource { stage: StageName },

    /// Every attempt against every available resource failed.
    #[error("resource '{resource}' unavailable for stage '{stage}' after {attempts} attempt(s): {last_error}")]
    Unavailable {
        stage: StageName,
        /// Last resource tried.
        resource: ResourceId,
        /// Attempts made across primary and alternate.
        attempts: u32,
        last_error: LlmError,
    },

    /// The resource answered, but not with the expected structure.
    #[error("malformed response from '{resource}' for stage '{stage}': {message}")]
    Malformed {
        stage: StageName,
        resource: ResourceId,
        message: String,
    },
}

impl From<InvocationFailure> for StageFailure {
    fn from(failure: InvocationFailure) -> Self {
        match failure {
            InvocationFailure::Cancelled => StageFailure::Cancelled,
            other => StageFailure::Invocation {
                message: other.to_string(),
            },
        }
    }
}

/// Why [`invoke`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Cancelled,
    Exhausted { attempts: u32, last_error: LlmError },
}

// ---------------------------------------------------------------------------
// Single-resource invocation
// ---------------------------------------------------------------------------

/// Invokes `provider` with retries, per-attempt timeouts and backoff.
///
/// Stops early on a non-retryable error. Cancellation is observed during both
/// the call and the backoff sleep.
pub async fn invoke(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
    policy: &InvokePolicy,
    cancel: &CancellationToken,
) -> Result<Completion, AttemptFailure> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
            r = tokio::time::timeout(policy.per_attempt_timeout, provider.complete(request.clone())) => r,
        };

        let error = match result {
            Ok(Ok(completion)) => return Ok(completion),
            Ok(Err(e)) => e,
            Err(_) => LlmError::Timeout {
                timeout: policy.per_attempt_timeout,
            },
        };

        if attempt >= policy.max_attempts || error.retry_policy() == RetryPolicy::NonRetryable {
            return Err(AttemptFailure::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.backoff(attempt, &error);
        warn!(
            model = provider.model_name(),
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after transient compute resource error"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Shared entry point: hands out one [`StageGateway`] per stage execution.
pub struct LlmGateway {
    catalog: Arc<ResourceCatalog>,
    connector: Arc<dyn ResourceConnector>,
    policy: InvokePolicy,
}

impl LlmGateway {
    pub fn new(
        catalog: ResourceCatalog,
        connector: Arc<dyn ResourceConnector>,
        policy: InvokePolicy,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            connector,
            policy,
        }
    }

    /// Creates a gateway bound to `stage`. Substitutions made through it last
    /// for the lifetime of the returned value.
    pub fn for_stage(&self, stage: &StageName) -> StageGateway {
        StageGateway {
            stage: stage.clone(),
            catalog: Arc::clone(&self.catalog),
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            active: Mutex::new(None),
        }
    }
}

#[derive(Clone)]
struct ActiveResource {
    descriptor: ResourceDescriptor,
    role: ResourceRole,
    provider: Arc<dyn LlmProvider>,
    substitution: Option<String>,
}

/// Resource selection and resilient invocation for one stage execution.
pub struct StageGateway {
    stage: StageName,
    catalog: Arc<ResourceCatalog>,
    connector: Arc<dyn ResourceConnector>,
    policy: InvokePolicy,
    active: Mutex<Option<ActiveResource>>,
}

impl StageGateway {
    pub fn stage(&self) -> &StageName {
        &self.stage
    }

    /// The resource actually serving this stage, once one has been selected.
    pub async fn usage(&self) -> Option<ResourceUsage> {
        self.active.lock().await.as_ref().map(|a| ResourceUsage {
            stage: self.stage.clone(),
            resource: a.descriptor.id.clone(),
            role: a.role,
            substituted: a.role == ResourceRole::Alternate,
            reason: a.substitution.clone(),
        })
    }

    /// Runs `request` against the stage's active resource, falling back to
    /// the alternate when the primary is unusable.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<(Completion, ResourceId), InvocationFailure> {
        let active = self.select_resource().await?;
        let primary_request = apply_defaults(request.clone(), &active.descriptor);

        let (attempts, last_error) =
            match invoke(active.provider.as_ref(), &primary_request, &self.policy, cancel).await {
                Ok(completion) => return Ok((completion, active.descriptor.id)),
                Err(AttemptFailure::Cancelled) => return Err(InvocationFailure::Cancelled),
                Err(AttemptFailure::Exhausted { attempts, last_error }) => {
                    if active.role == ResourceRole::Alternate {
                        return Err(InvocationFailure::Unavailable {
                            stage: self.stage.clone(),
                            resource: active.descriptor.id,
                            attempts,
                            last_error,
                        });
                    }
                    (attempts, last_error)
                }
            };

        let reason = format!(
            "primary '{}' failed after {attempts} attempt(s): {last_error}",
            active.descriptor.id
        );
        let Some(alternate) = self.switch_to_alternate(&active.descriptor.id, reason).await else {
            return Err(InvocationFailure::Unavailable {
                stage: self.stage.clone(),
                resource: active.descriptor.id,
                attempts,
                last_error,
            });
        };

        let alternate_request = apply_defaults(request, &alternate.descriptor);
        match invoke(alternate.provider.as_ref(), &alternate_request, &self.policy, cancel).await {
            Ok(completion) => Ok((completion, alternate.descriptor.id)),
            Err(AttemptFailure::Cancelled) => Err(InvocationFailure::Cancelled),
            Err(AttemptFailure::Exhausted {
                attempts: alt_attempts,
                last_error,
            }) => Err(InvocationFailure::Unavailable {
                stage: self.stage.clone(),
                resource: alternate.descriptor.id,
                attempts: attempts + alt_attempts,
                last_error,
            }),
        }
    }

    /// Like [`Self::complete`] but asks for JSON and deserialises the answer.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<T, InvocationFailure> {
        let (completion, resource) = self.complete(request.json(), cancel).await?;
        parse_json_response(&completion.text).map_err(|message| InvocationFailure::Malformed {
            stage: self.stage.clone(),
            resource,
            message,
        })
    }

    async fn select_resource(&self) -> Result<ActiveResource, InvocationFailure> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Ok(current.clone());
        }

        let primary = self
            .catalog
            .resolve(&self.stage, ResourceRole::Primary)
            .cloned()
            .ok_or_else(|| InvocationFailure::NoResource {
                stage: self.stage.clone(),
            })?;

        let init_error = match self.connector.connect(&primary).await {
            Ok(provider) => {
                debug!(stage = %self.stage, resource = %primary.id, "Primary resource initialised");
                let selected = ActiveResource {
                    descriptor: primary,
                    role: ResourceRole::Primary,
                    provider,
                    substitution: None,
                };
                *active = Some(selected.clone());
                return Ok(selected);
            }
            Err(e) => e,
        };

        warn!(
            stage = %self.stage,
            resource = %primary.id,
            error = %init_error,
            "Primary resource failed to initialise"
        );
        let reason = format!("primary '{}' failed to initialise: {init_error}", primary.id);
        match self.connect_alternate(&reason).await {
            Some(selected) => {
                *active = Some(selected.clone());
                Ok(selected)
            }
            None => Err(InvocationFailure::Unavailable {
                stage: self.stage.clone(),
                resource: primary.id,
                attempts: 0,
                last_error: init_error,
            }),
        }
    }

    async fn switch_to_alternate(&self, failed: &ResourceId, reason: String) -> Option<ActiveResource> {
        let mut active = self.active.lock().await;
        // Another caller may already have switched.
        if let Some(current) = active.as_ref() {
            if &current.descriptor.id != failed && current.role == ResourceRole::Alternate {
                return Some(current.clone());
            }
        }
        let selected = self.connect_alternate(&reason).await?;
        *active = Some(selected.clone());
        Some(selected)
    }

    async fn connect_alternate(&self, reason: &str) -> Option<ActiveResource> {
        let alternate = self.catalog.resolve(&self.stage, ResourceRole::Alternate)?.clone();
        match self.connector.connect(&alternate).await {
            Ok(provider) => {
                info!(
                    stage = %self.stage,
                    resource = %alternate.id,
                    reason,
                    "Switched to alternate compute resource"
                );
                Some(ActiveResource {
                    descriptor: alternate,
                    role: ResourceRole::Alternate,
                    provider,
                    substitution: Some(reason.to_string()),
                })
            }
            Err(e) => {
                warn!(
                    stage = %self.stage,
                    resource = %alternate.id,
                    error = %e,
                    "Alternate resource failed to initialise"
                );
                None
            }
        }
    }
}

fn apply_defaults(mut request: CompletionRequest, descriptor: &ResourceDescriptor) -> CompletionRequest {
    request.temperature.get_or_insert(descriptor.temperature);
    request.max_tokens.get_or_insert(descriptor.max_tokens);
    request
}

/// Extracts and deserialises the JSON payload of a model answer.
///
/// Accepts bare JSON, JSON inside a fenced code block, or JSON surrounded by
/// prose (the outermost `{...}` or `[...]` span is used).
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let trimmed = strip_fences(text.trim());
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let span = outer_span(trimmed, '{', '}').or_else(|| outer_span(trimmed, '[', ']'));
    match span {
        Some(candidate) => serde_json::from_str(candidate).map_err(|e| e.to_string()),
        None => Err("response contains no JSON value".to_string()),
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn outer_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}
