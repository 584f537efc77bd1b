//! The run state threaded through every stage, and the records the engine
//! keeps about each stage execution.
//!
//! Stages never mutate [`PipelineState`] directly. They read it by shared
//! reference and return a [`StageCommit`]; the executor is the single
//! mutator and applies the commit with [`PipelineState::apply`]. Applying a
//! commit fully replaces the committing stage's own output slot, which makes
//! re-running a stage idempotent, and refuses to touch any other slot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    AnalyzedDocument, Paper, QualityAssessment, ResearchQuery, ResearchReport, ResourceId,
    StageName, Synthesis, Timestamp, ValidationResult,
};

// ---------------------------------------------------------------------------
// Output slots
// ---------------------------------------------------------------------------

/// Names one per-stage output collection of [`PipelineState`].
///
/// The declaration order is the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSlot {
    Papers,
    AnalyzedDocuments,
    Validations,
    Synthesis,
    Report,
    Quality,
}

/// The full output collection of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
pub enum StageOutput {
    Papers(Vec<Paper>),
    AnalyzedDocuments(Vec<AnalyzedDocument>),
    Validations(Vec<ValidationResult>),
    Synthesis(Synthesis),
    Report(ResearchReport),
    Quality(QualityAssessment),
}

impl StageOutput {
    pub fn slot(&self) -> OutputSlot {
        match self {
            Self::Papers(_) => OutputSlot::Papers,
            Self::AnalyzedDocuments(_) => OutputSlot::AnalyzedDocuments,
            Self::Validations(_) => OutputSlot::Validations,
            Self::Synthesis(_) => OutputSlot::Synthesis,
            Self::Report(_) => OutputSlot::Report,
            Self::Quality(_) => OutputSlot::Quality,
        }
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Which resource served a stage, and whether it was a substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub stage: StageName,
    pub resource: ResourceId,
    pub role: crate::ResourceRole,
    /// `true` when the alternate replaced a failing primary.
    pub substituted: bool,
    /// Why the substitution happened, if it did.
    pub reason: Option<String>,
}

/// Everything a stage produced in one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCommit {
    pub output: StageOutput,
    pub warnings: Vec<String>,
    /// Recoverable problems the stage absorbed (e.g. every source failed).
    pub errors: Vec<String>,
    pub resources: Vec<ResourceUsage>,
}

impl StageCommit {
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            warnings: Vec::new(),
            errors: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceUsage>) -> Self {
        self.resources = resources;
        self
    }
}

/// A commit tried to write a slot other than the one its stage owns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage '{stage}' owns slot {owned:?} but committed {written:?}")]
pub struct SlotViolation {
    pub stage: StageName,
    pub owned: OutputSlot,
    pub written: OutputSlot,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One error or warning, tagged with its origin and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Stage that produced the entry; `None` for run-level entries.
    pub stage: Option<StageName>,
    pub at: Timestamp,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "[{}] {}: {}", self.at, stage, self.message),
            None => write!(f, "[{}] {}", self.at, self.message),
        }
    }
}

/// The single record threaded through all stages of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub query: ResearchQuery,
    pub papers: Vec<Paper>,
    pub analyzed_documents: Vec<AnalyzedDocument>,
    pub validations: Vec<ValidationResult>,
    pub synthesis: Option<Synthesis>,
    pub report: Option<ResearchReport>,
    pub quality: Option<QualityAssessment>,
    pub errors: Vec<LogEntry>,
    pub warnings: Vec<LogEntry>,
    /// Incremented on every applied commit or cleared slot.
    pub revision: u64,
    pub current_stage: Option<StageName>,
    /// Number of completed quality revision passes.
    pub rework_count: u32,
    pub resources: Vec<ResourceUsage>,
}

impl PipelineState {
    /// Creates a state whose only populated field is the query.
    pub fn new(query: ResearchQuery) -> Self {
        Self {
            query,
            papers: Vec::new(),
            analyzed_documents: Vec::new(),
            validations: Vec::new(),
            synthesis: None,
            report: None,
            quality: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            revision: 0,
            current_stage: None,
            rework_count: 0,
            resources: Vec::new(),
        }
    }

    /// Applies a stage commit, replacing the stage's output slot.
    ///
    /// # Errors
    ///
    /// Returns [`SlotViolation`] without modifying the state if the commit
    /// writes a slot other than `owned`.
    pub fn apply(
        &mut self,
        stage: &StageName,
        owned: OutputSlot,
        commit: StageCommit,
    ) -> Result<(), SlotViolation> {
        let written = commit.output.slot();
        if written != owned {
            return Err(SlotViolation {
                stage: stage.clone(),
                owned,
                written,
            });
        }

        match commit.output {
            StageOutput::Papers(v) => self.papers = v,
            StageOutput::AnalyzedDocuments(v) => self.analyzed_documents = v,
            StageOutput::Validations(v) => self.validations = v,
            StageOutput::Synthesis(v) => self.synthesis = Some(v),
            StageOutput::Report(v) => self.report = Some(v),
            StageOutput::Quality(v) => self.quality = Some(v),
        }
        for warning in commit.warnings {
            self.record_warning(Some(stage), warning);
        }
        for error in commit.errors {
            self.record_error(Some(stage), error);
        }
        self.resources.retain(|r| &r.stage != stage);
        self.resources.extend(commit.resources);
        self.revision += 1;
        Ok(())
    }

    /// Empties one output slot (used when a stage fails and the run continues).
    pub fn clear(&mut self, slot: OutputSlot) {
        match slot {
            OutputSlot::Papers => self.papers.clear(),
            OutputSlot::AnalyzedDocuments => self.analyzed_documents.clear(),
            OutputSlot::Validations => self.validations.clear(),
            OutputSlot::Synthesis => self.synthesis = None,
            OutputSlot::Report => self.report = None,
            OutputSlot::Quality => self.quality = None,
        }
        self.revision += 1;
    }

    pub fn record_error(&mut self, stage: Option<&StageName>, message: impl Into<String>) {
        self.errors.push(LogEntry {
            stage: stage.cloned(),
            at: Timestamp::now(),
            message: message.into(),
        });
    }

    pub fn record_warning(&mut self, stage: Option<&StageName>, message: impl Into<String>) {
        self.warnings.push(LogEntry {
            stage: stage.cloned(),
            at: Timestamp::now(),
            message: message.into(),
        });
    }

    /// Latest quality feedback, used by synthesis on a revision pass.
    pub fn quality_feedback(&self) -> Option<&str> {
        self.quality.as_ref().map(|q| q.feedback.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcomes and run status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    /// Precondition unsatisfied; the stage did not execute.
    Skipped,
    Failed,
    Cancelled,
    TimedOut,
}

/// Result of one stage execution, kept for run introspection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

/// Lifecycle of a pipeline run.
///
/// `Pending → Running(first) → … → Completed`, or
/// `Running(s) → StageFailed(s) → Aborted` when the failure policy does not
/// tolerate the failure. Cancellation and run timeout go straight to
/// `Aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running { stage: StageName },
    StageFailed { stage: StageName },
    Completed,
    Aborted { stage: Option<StageName>, reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted { .. })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running { stage } => write!(f, "running({stage})"),
            Self::StageFailed { stage } => write!(f, "stage_failed({stage})"),
            Self::Completed => f.write_str("completed"),
            Self::Aborted { stage: Some(stage), reason } => {
                write!(f, "aborted at {stage}: {reason}")
            }
            Self::Aborted { stage: None, reason } => write!(f, "aborted: {reason}"),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
