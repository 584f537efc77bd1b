//! Per-document analysis of the retrieved abstracts.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    AnalyzedDocument, CompletionRequest, OutputSlot, Paper, PipelineState, Precondition,
    ResearchQuery, Stage, StageCommit, StageContext, StageFailure, StageName, StageOutput,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::{any_cancelled, excerpt, map_bounded};
use crate::gateway::LlmGateway;

/// Confidence assigned to analyses derived from the abstract alone.
const FALLBACK_CONFIDENCE: f64 = 0.2;

pub struct DocumentAnalysisStage {
    name: StageName,
    gateway: Arc<LlmGateway>,
    concurrency: usize,
}

impl DocumentAnalysisStage {
    pub fn new(gateway: Arc<LlmGateway>, concurrency: usize) -> Self {
        Self {
            name: StageName::from_static(pipeline::stage::names::DOCUMENT_ANALYSIS),
            gateway,
            concurrency,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    key_findings: Vec<String>,
    #[serde(default)]
    methodology: String,
    #[serde(default)]
    results_summary: String,
    #[serde(default)]
    limitations: Vec<String>,
    #[serde(default)]
    concepts: Vec<String>,
    #[serde(default)]
    approaches: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

#[async_trait]
impl Stage for DocumentAnalysisStage {
    fn name(&self) -> &StageName {
        &self.name
    }

    fn output_slot(&self) -> OutputSlot {
        OutputSlot::AnalyzedDocuments
    }

    fn precondition(&self, state: &PipelineState) -> Precondition {
        Precondition::require(!state.papers.is_empty(), "no candidate documents to analyse")
    }

    async fn execute(&self, state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
        let gateway = self.gateway.for_stage(&self.name);
        let results = map_bounded(&state.papers, self.concurrency, |paper| {
            let request = analysis_request(&state.query, paper);
            let gateway = &gateway;
            async move { gateway.complete_json::<AnalysisResponse>(request, &ctx.cancel).await }
        })
        .await;
        if any_cancelled(&results) {
            return Err(StageFailure::Cancelled);
        }

        let mut warnings = Vec::new();
        let documents: Vec<AnalyzedDocument> = state
            .papers
            .iter()
            .zip(results)
            .map(|(paper, result)| match result {
                Ok(response) => AnalyzedDocument {
                    paper_title: paper.title.clone(),
                    key_findings: response.key_findings,
                    methodology: response.methodology,
                    results_summary: response.results_summary,
                    limitations: response.limitations,
                    concepts: response.concepts,
                    approaches: response.approaches,
                    confidence: response.confidence.clamp(0.0, 1.0),
                    fallback: false,
                },
                Err(failure) => {
                    warn!(paper = %paper.title, error = %failure, "Analysis failed; using abstract fallback");
                    warnings.push(format!("analysis of '{}' fell back to the abstract: {failure}", paper.title));
                    fallback_analysis(paper)
                }
            })
            .collect();

        info!(
            documents = documents.len(),
            fallbacks = warnings.len(),
            "Document analysis finished"
        );
        let resources = gateway.usage().await.into_iter().collect();
        Ok(StageCommit::new(StageOutput::AnalyzedDocuments(documents))
            .with_warnings(warnings)
            .with_resources(resources))
    }
}

fn analysis_request(query: &ResearchQuery, paper: &Paper) -> CompletionRequest {
    CompletionRequest::new(format!(
        "Research question: {}\nDomain: {}\n\nPaper: {}\nAuthors: {}\nAbstract: {}\n\n\
         Extract the key findings, the methodology, a short results summary, limitations, \
         the domain concepts discussed and the pedagogical or experimental approaches used. \
         Rate your confidence from 0.0 to 1.0.\n\
         Answer with JSON only: {{\"key_findings\": [], \"methodology\": \"\", \"results_summary\": \"\", \
         \"limitations\": [], \"concepts\": [], \"approaches\": [], \"confidence\": 0.0}}",
        query.question,
        query.domain,
        paper.title,
        paper.authors.join(", "),
        excerpt(&paper.summary, 2000),
    ))
    .with_system("You are a research analyst extracting structured findings from academic papers.")
}

/// Low-confidence analysis built from the abstract when the call failed.
fn fallback_analysis(paper: &Paper) -> AnalyzedDocument {
    let first_sentence = paper
        .summary
        .split_inclusive(". ")
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    AnalyzedDocument {
        paper_title: paper.title.clone(),
        key_findings: first_sentence.into_iter().collect(),
        methodology: "not determined".into(),
        results_summary: excerpt(&paper.summary, 300),
        limitations: vec!["automated analysis unavailable".into()],
        concepts: paper.keywords.clone(),
        approaches: Vec::new(),
        confidence: FALLBACK_CONFIDENCE,
        fallback: true,
    }
}
