//! Literature retrieval and ranking, the first pipeline stage.
//!
//! The stage runs five steps in order:
//!
//! 1. [`keywords`]: LLM keyword expansion, falling back to the user keywords.
//! 2. [`fetch`]: concurrent, individually time-bounded fan-out over the source
//!    adapters, joined in registration order.
//! 3. [`dedup`]: DOI / title duplicate removal, first-seen wins.
//! 4. [`ranking`]: heuristic scores for all, LLM judgments for the top-K.
//! 5. [`filter`]: threshold, years, exclusions and source-count bounds.

pub mod dedup;
pub mod fetch;
pub mod filter;
pub mod keywords;
pub mod ranking;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use pipeline::{
    OutputSlot, PipelineState, Precondition, RetrievalSettings, SearchRequest, SourceAdapter,
    Stage, StageCommit, StageContext, StageFailure, StageName, StageOutput,
};
use tracing::{error, info};

use crate::gateway::LlmGateway;

pub struct LiteratureSearchStage {
    name: StageName,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    gateway: Arc<LlmGateway>,
    settings: RetrievalSettings,
    /// Fixed "current year" for recency scoring; the wall clock when unset.
    reference_year: Option<i32>,
}

impl LiteratureSearchStage {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        gateway: Arc<LlmGateway>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            name: StageName::from_static(pipeline::stage::names::LITERATURE_SEARCH),
            adapters,
            gateway,
            settings,
            reference_year: None,
        }
    }

    pub fn with_reference_year(mut self, year: i32) -> Self {
        self.reference_year = Some(year);
        self
    }
}

#[async_trait]
impl Stage for LiteratureSearchStage {
    fn name(&self) -> &StageName {
        &self.name
    }

    fn output_slot(&self) -> OutputSlot {
        OutputSlot::Papers
    }

    fn precondition(&self, state: &PipelineState) -> Precondition {
        Precondition::require(
            !state.query.question.trim().is_empty(),
            "research question is empty",
        )
    }

    async fn execute(&self, state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
        let query = &state.query;
        let gateway = self.gateway.for_stage(&self.name);
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let expansion = keywords::expand_keywords(query, &gateway, self.settings.max_keywords, &ctx.cancel).await?;
        warnings.extend(expansion.warning);

        let request = SearchRequest {
            question_terms: keywords::question_terms(&query.question),
            keywords: expansion.keywords,
            domain_terms: query.domain.search_terms().iter().map(|t| t.to_string()).collect(),
            limit: self.settings.results_per_source,
        };

        let fetched = fetch::fetch_all(&self.adapters, &request, self.settings.source_timeout(), &ctx.cancel)
            .await
            .ok_or(StageFailure::Cancelled)?;
        warnings.extend(fetched.failures.iter().map(|e| format!("literature source failed: {e}")));
        if fetched.all_failed() {
            let message = if self.adapters.is_empty() {
                "no literature sources configured".to_string()
            } else {
                format!("all {} literature sources failed", self.adapters.len())
            };
            error!(sources = self.adapters.len(), "{message}");
            errors.push(message);
        }

        let fetched_count = fetched.papers.len();
        let unique = dedup::deduplicate(fetched.papers);
        let unique_count = unique.len();

        let reference_year = self.reference_year.unwrap_or_else(|| Utc::now().year());
        let ranked = ranking::rank(unique, query, &self.settings, reference_year, &gateway, &ctx.cancel).await?;
        warnings.extend(ranked.warning);

        let selection = filter::select(ranked.papers, query, self.settings.min_relevance);
        warnings.extend(selection.warning);

        info!(
            fetched = fetched_count,
            unique = unique_count,
            selected = selection.papers.len(),
            "Literature retrieval finished"
        );

        let resources = gateway.usage().await.into_iter().collect();
        Ok(StageCommit::new(StageOutput::Papers(selection.papers))
            .with_warnings(warnings)
            .with_errors(errors)
            .with_resources(resources))
    }
}
