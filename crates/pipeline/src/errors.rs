//! Top-level error and retry-policy types for the research pipeline domain.
//!
//! [`ResearchError`] covers the conditions that prevent a run from starting
//! at all (malformed query, invalid configuration, unknown run). Everything
//! that goes wrong *inside* a run is recovered into the
//! [`crate::PipelineState`] error and warning logs instead.
//!
//! [`LlmError`] and [`SourceError`] are the failure types of the two external
//! collaborator ports. [`RetryPolicy`] is a cross-cutting concern: any error
//! type that participates in retry decisions must be able to produce one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PipelineRunId, ResourceId, SourceName};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the resilience layer decide
/// whether to re-invoke an operation.
///
/// - `Retryable` errors: timeouts, connection resets, transient rate limits,
///   server-side (5xx) failures.
/// - `NonRetryable` errors: client errors, missing models, malformed responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Run-level setup errors
// ---------------------------------------------------------------------------

/// Errors that prevent a pipeline run from starting or being inspected.
///
/// These are the only faults allowed to escape `PipelineExecutor::run`;
/// stage-level problems are always recorded into the run state.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// The research query is malformed (empty question, inverted bounds, ...).
    #[error("Invalid research query: {reason}")]
    InvalidQuery {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// The pipeline configuration is invalid or incomplete.
    ///
    /// Produced at load time; the pipeline never starts with an invalid config.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// No checkpoint exists for the requested run.
    #[error("Unknown pipeline run: {run_id}")]
    UnknownRun {
        /// The run identifier that was looked up.
        run_id: PipelineRunId,
    },

    /// A checkpoint could not be written or read.
    #[error("Checkpoint store failure: {message}")]
    Checkpoint {
        /// Description of the storage failure.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Compute resource errors
// ---------------------------------------------------------------------------

/// Failures of a compute resource (LLM inference endpoint).
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum LlmError {
    /// The resource could not be initialised (endpoint unreachable, model not
    /// installed). Triggers the alternate-resource fallback.
    #[error("Resource '{resource}' failed to initialise: {message}")]
    ResourceUnavailable {
        /// Resource that failed to initialise.
        resource: ResourceId,
        /// Underlying cause.
        message: String,
    },

    /// The connection to the endpoint failed mid-call.
    #[error("Connection to compute resource failed: {message}")]
    Connection {
        /// Underlying cause.
        message: String,
    },

    /// A single attempt exceeded its timeout.
    #[error("Request timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The per-attempt timeout that elapsed.
        timeout: Duration,
    },

    /// The endpoint asked the caller to slow down.
    #[error("Rate limited by compute resource")]
    RateLimited {
        /// Server-provided minimum delay, if any.
        retry_after: Option<Duration>,
    },

    /// The endpoint answered with a non-success HTTP status.
    #[error("Compute resource returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body excerpt or reason phrase.
        message: String,
    },

    /// The endpoint answered, but the payload did not match the expected shape.
    #[error("Malformed response: {message}")]
    MalformedResponse {
        /// What could not be parsed.
        message: String,
    },
}

impl LlmError {
    /// Retry classification used by the resilience layer.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Http { status, .. } if *status >= 500 || *status == 408 => {
                RetryPolicy::Retryable { after: None }
            }
            Self::Http { .. } | Self::ResourceUnavailable { .. } | Self::MalformedResponse { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Source adapter errors
// ---------------------------------------------------------------------------

/// Failures of a literature source adapter.
///
/// Never fatal to a run: the retrieval stage turns each into a warning and the
/// failing source contributes zero documents.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// The HTTP request could not be sent or the body not read.
    #[error("{source_name}: request failed: {message}")]
    Request {
        /// Adapter that failed.
        source_name: SourceName,
        /// Underlying cause.
        message: String,
    },

    /// The source answered with a non-success HTTP status.
    #[error("{source_name}: HTTP {status}")]
    Status {
        /// Adapter that failed.
        source_name: SourceName,
        /// HTTP status code.
        status: u16,
    },

    /// The response body could not be parsed.
    #[error("{source_name}: unparseable response: {message}")]
    Parse {
        /// Adapter that failed.
        source_name: SourceName,
        /// What could not be parsed.
        message: String,
    },

    /// The adapter did not answer within its bounded timeout.
    #[error("{source_name}: timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Adapter that timed out.
        source_name: SourceName,
        /// The timeout that elapsed.
        after: Duration,
    },
}
