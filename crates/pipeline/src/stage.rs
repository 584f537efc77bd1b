//! The stage contract the executor programs against.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{OutputSlot, PipelineRunId, PipelineState, StageCommit, StageName};

/// Canonical stage names, in pipeline order.
pub mod names {
    pub const LITERATURE_SEARCH: &str = "literature_search";
    pub const DOCUMENT_ANALYSIS: &str = "document_analysis";
    pub const CONCEPT_VALIDATION: &str = "concept_validation";
    pub const CONTENT_SYNTHESIS: &str = "content_synthesis";
    pub const REPORT_GENERATION: &str = "report_generation";
    pub const QUALITY_CONTROL: &str = "quality_control";

    pub const ALL: [&str; 6] = [
        LITERATURE_SEARCH,
        DOCUMENT_ANALYSIS,
        CONCEPT_VALIDATION,
        CONTENT_SYNTHESIS,
        REPORT_GENERATION,
        QUALITY_CONTROL,
    ];
}

/// Result of a stage's precondition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Satisfied,
    Unsatisfied { reason: String },
}

impl Precondition {
    pub fn unsatisfied(reason: impl Into<String>) -> Self {
        Self::Unsatisfied {
            reason: reason.into(),
        }
    }

    /// `Satisfied` when `condition` holds, otherwise `Unsatisfied` with `reason`.
    pub fn require(condition: bool, reason: impl Into<String>) -> Self {
        if condition {
            Self::Satisfied
        } else {
            Self::unsatisfied(reason)
        }
    }
}

/// Per-execution context handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: PipelineRunId,
    /// Run-scoped cancellation signal. Advisory: a stage that observes it
    /// should abort in-flight calls and return [`StageFailure::Cancelled`].
    pub cancel: CancellationToken,
    /// Revision pass number (0 on the first pass).
    pub rework: u32,
}

/// Structured failure returned by a stage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageFailure {
    #[error("stage cancelled")]
    Cancelled,

    #[error("stage timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    /// A compute resource call the stage could not do without failed.
    #[error("compute resource invocation failed: {message}")]
    Invocation { message: String },

    /// Any other internal fault, including a caught panic.
    #[error("stage fault: {message}")]
    Fault { message: String },
}

/// One step of the research pipeline.
///
/// Implementations read prior outputs from the state and return a commit that
/// fully replaces their own output slot, so re-running a stage against the
/// same input never duplicates entries.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &StageName;

    /// The single output slot this stage writes.
    fn output_slot(&self) -> OutputSlot;

    fn precondition(&self, state: &PipelineState) -> Precondition;

    async fn execute(
        &self,
        state: &PipelineState,
        ctx: &StageContext,
    ) -> Result<StageCommit, StageFailure>;
}
