//! Core domain of the research pipeline.
//!
//! This crate contains every domain concept, newtype identifier, stage output
//! record, configuration type and error type used throughout the workspace,
//! together with the port traits infrastructure crates implement. It never
//! performs I/O.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate defines *what* is
//! needed; `nodes` orchestrates it, and `llm` / `sources` supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`PipelineRunId`, `StageName`, `ResourceId`, ...) |
//! | [`types`] | Scores and timestamps |
//! | [`errors`] | `ResearchError`, `LlmError`, `SourceError`, `RetryPolicy` |
//! | [`query`] | `ResearchQuery` and its builder |
//! | [`paper`] | Candidate documents and their normalisation rules |
//! | [`outputs`] | Typed outputs of the downstream stages |
//! | [`state`] | `PipelineState`, `StageCommit`, outcomes and run status |
//! | [`stage`] | The `Stage` contract |
//! | [`llm`] | Compute resource ports |
//! | [`sources`] | Literature source port |
//! | [`checkpoint`] | Run checkpoints and the store port |
//! | [`config`] | `ResearchConfig` and the resource catalog |

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod identifiers;
pub mod llm;
pub mod outputs;
pub mod paper;
pub mod query;
pub mod sources;
pub mod stage;
pub mod state;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{
    EngineSettings, FailurePolicy, QueryDefaults, ResearchConfig, ResourceCatalog,
    ResourceDescriptor, ResourceRole, ResourceSpec, RetrievalSettings, RetrySettings,
    SourceSettings, StageAssignment,
};
pub use errors::{LlmError, ResearchError, RetryPolicy, SourceError};
pub use identifiers::{PipelineRunId, ResourceId, SessionId, SourceName, StageName};
pub use llm::{Completion, CompletionRequest, LlmProvider, ResourceConnector};
pub use outputs::{
    AnalyzedDocument, AspectScores, InsightKind, QualityAssessment, QualityLevel, ReportSection,
    ResearchReport, Synthesis, SynthesisInsight, ValidationResult,
};
pub use paper::Paper;
pub use query::{ResearchDomain, ResearchQuery, ResearchQueryBuilder, YearRange};
pub use sources::{SearchRequest, SourceAdapter};
pub use stage::{Precondition, Stage, StageContext, StageFailure};
pub use state::{
    LogEntry, OutputSlot, PipelineState, ResourceUsage, RunStatus, SlotViolation, StageCommit,
    StageOutcome, StageOutput, StageStatus,
};
pub use types::{QualityScore, RelevanceScore, Timestamp};
