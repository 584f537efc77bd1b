//! Research pipeline orchestration: stages, the LLM gateway and the executor.
//!
//! This crate provides the six default pipeline stages (literature search
//! through quality control), the LLM gateway that wraps every compute call
//! with retries, timeouts and alternate-resource substitution, and the
//! [`PipelineExecutor`] that drives a [`pipeline::PipelineState`] through the
//! stages.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Stages sequence calls between business rules in
//! the [`pipeline`] crate and the infrastructure ports (`ResourceConnector`,
//! `SourceAdapter`, `CheckpointStore`). Concrete adapters live in `llm` and
//! `sources`; this crate never opens a network connection itself.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`executor`] | `PipelineExecutor`, revision loop, run outcomes |
//! | [`gateway`] | `LlmGateway`, `StageGateway`, the `invoke` retry loop |
//! | [`retrieval`] | `LiteratureSearchStage` and its five steps |
//! | [`stages`] | Analysis, validation, synthesis, report and quality stages |
//! | [`checkpoint`] | In-memory and JSON-file checkpoint stores |

pub mod checkpoint;
pub mod executor;
pub mod gateway;
pub mod retrieval;
pub mod stages;

use std::sync::Arc;

use pipeline::{CheckpointStore, ResearchConfig, ResearchError, ResourceConnector, SourceAdapter, Stage};

pub use checkpoint::{InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use executor::{ExecutorSettings, PipelineExecutor, RevisionLoop, RunOutcome, RunStatusReport};
pub use gateway::{InvocationFailure, InvokePolicy, LlmGateway, StageGateway};
pub use retrieval::LiteratureSearchStage;
pub use stages::{
    ConceptValidationStage, ContentSynthesisStage, DocumentAnalysisStage, QualityControlStage,
    ReportGenerationStage,
};

/// The six default stages in pipeline order, sharing one gateway.
pub fn default_stages(
    config: &ResearchConfig,
    gateway: Arc<LlmGateway>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
) -> Vec<Arc<dyn Stage>> {
    let concurrency = config.engine.document_concurrency;
    vec![
        Arc::new(LiteratureSearchStage::new(
            adapters,
            Arc::clone(&gateway),
            config.retrieval.clone(),
        )),
        Arc::new(DocumentAnalysisStage::new(Arc::clone(&gateway), concurrency)),
        Arc::new(ConceptValidationStage::new(Arc::clone(&gateway), concurrency)),
        Arc::new(ContentSynthesisStage::new(Arc::clone(&gateway))),
        Arc::new(ReportGenerationStage::new(Arc::clone(&gateway))),
        Arc::new(QualityControlStage::new(gateway, config.engine.min_quality_score)),
    ]
}

/// Validates `config` and assembles the default pipeline.
///
/// # Errors
///
/// Returns [`ResearchError::Configuration`] if the configuration is invalid.
pub fn build_pipeline(
    config: &ResearchConfig,
    connector: Arc<dyn ResourceConnector>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> Result<PipelineExecutor, ResearchError> {
    config.validate()?;
    let gateway = Arc::new(LlmGateway::new(
        config.catalog()?,
        connector,
        InvokePolicy::from(&config.retry),
    ));
    let stages = default_stages(config, gateway, adapters);
    PipelineExecutor::new(stages, ExecutorSettings::from(&config.engine), checkpoints)
}
