//! Cross-document synthesis of the analysed literature.
//!
//! One call produces a summary plus typed insights. On a revision pass the
//! previous quality feedback is included in the prompt. When the call fails
//! a deterministic concept-frequency synthesis is committed instead, with a
//! warning, so the report stage always has something to work from.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    AnalyzedDocument, CompletionRequest, InsightKind, OutputSlot, PipelineState, Precondition,
    Stage, StageCommit, StageContext, StageFailure, StageName, StageOutput, Synthesis,
    SynthesisInsight,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::excerpt;
use crate::gateway::{InvocationFailure, LlmGateway};

/// Insights kept from one synthesis.
const MAX_INSIGHTS: usize = 12;
/// Concept-frequency patterns emitted by the fallback.
const MAX_FALLBACK_PATTERNS: usize = 5;

pub struct ContentSynthesisStage {
    name: StageName,
    gateway: Arc<LlmGateway>,
}

impl ContentSynthesisStage {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            name: StageName::from_static(pipeline::stage::names::CONTENT_SYNTHESIS),
            gateway,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InsightResponse {
    kind: InsightKind,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    supporting_evidence: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    related_documents: Vec<String>,
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    summary: String,
    #[serde(default)]
    insights: Vec<InsightResponse>,
}

#[async_trait]
impl Stage for ContentSynthesisStage {
    fn name(&self) -> &StageName {
        &self.name
    }

    fn output_slot(&self) -> OutputSlot {
        OutputSlot::Synthesis
    }

    fn precondition(&self, state: &PipelineState) -> Precondition {
        Precondition::require(
            !state.analyzed_documents.is_empty(),
            "no analysed documents to synthesise",
        )
    }

    async fn execute(&self, state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
        let gateway = self.gateway.for_stage(&self.name);
        let feedback = (ctx.rework > 0).then(|| state.quality_feedback()).flatten();
        let request = synthesis_request(state, feedback);

        let mut warnings = Vec::new();
        let synthesis = match gateway.complete_json::<SynthesisResponse>(request, &ctx.cancel).await {
            Ok(response) => Synthesis {
                summary: response.summary,
                insights: response
                    .insights
                    .into_iter()
                    .take(MAX_INSIGHTS)
                    .map(|i| SynthesisInsight {
                        kind: i.kind,
                        title: i.title,
                        description: i.description,
                        supporting_evidence: i.supporting_evidence,
                        confidence: i.confidence.clamp(0.0, 1.0),
                        related_documents: i.related_documents,
                    })
                    .collect(),
                revision: ctx.rework,
            },
            Err(InvocationFailure::Cancelled) => return Err(StageFailure::Cancelled),
            Err(failure) => {
                warn!(error = %failure, "Synthesis call failed; using concept-frequency synthesis");
                warnings.push(format!("synthesis fell back to concept frequencies: {failure}"));
                fallback_synthesis(&state.analyzed_documents, ctx.rework)
            }
        };

        info!(
            insights = synthesis.insights.len(),
            revision = synthesis.revision,
            "Content synthesis finished"
        );
        let resources = gateway.usage().await.into_iter().collect();
        Ok(StageCommit::new(StageOutput::Synthesis(synthesis))
            .with_warnings(warnings)
            .with_resources(resources))
    }
}

fn synthesis_request(state: &PipelineState, feedback: Option<&str>) -> CompletionRequest {
    let mut prompt = format!(
        "Research question: {}\nDomain: {}\n\nAnalysed documents:\n",
        state.query.question, state.query.domain
    );
    for doc in &state.analyzed_documents {
        prompt.push_str(&format!(
            "- {}\n  Findings: {}\n  Methodology: {}\n  Concepts: {}\n",
            doc.paper_title,
            excerpt(&doc.key_findings.join("; "), 400),
            excerpt(&doc.methodology, 200),
            doc.concepts.join(", "),
        ));
    }

    let invalid: Vec<String> = state
        .validations
        .iter()
        .filter(|v| !v.is_valid)
        .map(|v| format!("- {} ({}): {}", v.concept, v.document, v.explanation))
        .collect();
    if !invalid.is_empty() {
        prompt.push_str("\nConcepts flagged as incorrect, do not rely on them:\n");
        prompt.push_str(&invalid.join("\n"));
        prompt.push('\n');
    }

    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\nA previous synthesis was reviewed. Address this feedback:\n{feedback}\n"
        ));
    }

    prompt.push_str(
        "\nIdentify patterns, contradictions, gaps, converging evidence and trends across the \
         documents. Answer with JSON only: {\"summary\": \"\", \"insights\": [{\"kind\": \
         \"pattern|contradiction|gap|evidence|trend\", \"title\": \"\", \"description\": \"\", \
         \"supporting_evidence\": [], \"confidence\": 0.0, \"related_documents\": []}]}",
    );
    CompletionRequest::new(prompt)
        .with_system("You are a senior researcher synthesising findings across studies.")
}

/// Concepts shared by several documents become pattern insights.
fn fallback_synthesis(documents: &[AnalyzedDocument], revision: u32) -> Synthesis {
    let mut by_concept: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for doc in documents {
        let mut seen = Vec::new();
        for concept in &doc.concepts {
            let key = concept.trim().to_lowercase();
            if key.is_empty() || seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            by_concept.entry(key).or_default().push(&doc.paper_title);
        }
    }

    let mut shared: Vec<(String, Vec<&str>)> = by_concept
        .into_iter()
        .filter(|(_, docs)| docs.len() >= 2)
        .collect();
    // Most widely shared first; BTreeMap order breaks ties alphabetically.
    shared.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let total = documents.len();
    let insights: Vec<SynthesisInsight> = shared
        .iter()
        .take(MAX_FALLBACK_PATTERNS)
        .map(|(concept, docs)| SynthesisInsight {
            kind: InsightKind::Pattern,
            title: format!("Recurring concept: {concept}"),
            description: format!("'{concept}' is discussed in {} of {total} documents.", docs.len()),
            supporting_evidence: Vec::new(),
            confidence: docs.len() as f64 / total.max(1) as f64,
            related_documents: docs.iter().map(|d| d.to_string()).collect(),
        })
        .collect();

    let summary = if insights.is_empty() {
        format!("{total} document(s) were analysed; no concept is shared between them.")
    } else {
        let names: Vec<&str> = shared
            .iter()
            .take(MAX_FALLBACK_PATTERNS)
            .map(|(c, _)| c.as_str())
            .collect();
        format!(
            "{total} document(s) were analysed. Recurring concepts: {}.",
            names.join(", ")
        )
    };

    Synthesis {
        summary,
        insights,
        revision,
    }
}
