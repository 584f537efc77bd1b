//! Domain validation of the concepts each analysis extracted.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    AnalyzedDocument, CompletionRequest, OutputSlot, PipelineState, Precondition, ResearchQuery,
    Stage, StageCommit, StageContext, StageFailure, StageName, StageOutput, ValidationResult,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::{any_cancelled, map_bounded};
use crate::gateway::LlmGateway;

/// Concepts validated per document.
pub const MAX_CONCEPTS_PER_DOCUMENT: usize = 8;

pub struct ConceptValidationStage {
    name: StageName,
    gateway: Arc<LlmGateway>,
    concurrency: usize,
}

impl ConceptValidationStage {
    pub fn new(gateway: Arc<LlmGateway>, concurrency: usize) -> Self {
        Self {
            name: StageName::from_static(pipeline::stage::names::CONCEPT_VALIDATION),
            gateway,
            concurrency,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    concept: String,
    is_valid: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    suggested_corrections: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    validations: Vec<Verdict>,
}

#[async_trait]
impl Stage for ConceptValidationStage {
    fn name(&self) -> &StageName {
        &self.name
    }

    fn output_slot(&self) -> OutputSlot {
        OutputSlot::Validations
    }

    fn precondition(&self, state: &PipelineState) -> Precondition {
        Precondition::require(
            !state.analyzed_documents.is_empty(),
            "no analysed documents to validate",
        )
    }

    async fn execute(&self, state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
        let gateway = self.gateway.for_stage(&self.name);
        let documents: Vec<&AnalyzedDocument> = state
            .analyzed_documents
            .iter()
            .filter(|d| !d.concepts.is_empty())
            .collect();

        let results = map_bounded(&documents, self.concurrency, |doc| {
            let request = validation_request(&state.query, doc);
            let gateway = &gateway;
            async move { gateway.complete_json::<ValidationResponse>(request, &ctx.cancel).await }
        })
        .await;
        if any_cancelled(&results) {
            return Err(StageFailure::Cancelled);
        }

        let mut warnings = Vec::new();
        let mut validations = Vec::new();
        for (doc, result) in documents.iter().zip(results) {
            match result {
                Ok(response) => validations.extend(verdicts_for(doc, response.validations)),
                Err(failure) => {
                    warn!(document = %doc.paper_title, error = %failure, "Concept validation failed");
                    warnings.push(format!(
                        "concepts of '{}' were not validated: {failure}",
                        doc.paper_title
                    ));
                }
            }
        }

        let invalid = validations.iter().filter(|v| !v.is_valid).count();
        info!(
            validated = validations.len(),
            invalid,
            "Concept validation finished"
        );
        let resources = gateway.usage().await.into_iter().collect();
        Ok(StageCommit::new(StageOutput::Validations(validations))
            .with_warnings(warnings)
            .with_resources(resources))
    }
}

/// Keeps verdicts for concepts the document actually listed, once each.
fn verdicts_for(doc: &AnalyzedDocument, verdicts: Vec<Verdict>) -> Vec<ValidationResult> {
    let requested = &doc.concepts[..doc.concepts.len().min(MAX_CONCEPTS_PER_DOCUMENT)];
    let mut seen: Vec<&str> = Vec::new();
    let mut out = Vec::new();
    for verdict in verdicts {
        let Some(concept) = requested
            .iter()
            .find(|c| c.trim().eq_ignore_ascii_case(verdict.concept.trim()))
        else {
            continue;
        };
        if seen.contains(&concept.as_str()) {
            continue;
        }
        seen.push(concept);
        out.push(ValidationResult {
            document: doc.paper_title.clone(),
            concept: concept.clone(),
            is_valid: verdict.is_valid,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            explanation: verdict.explanation,
            suggested_corrections: verdict.suggested_corrections,
        });
    }
    out
}

fn validation_request(query: &ResearchQuery, doc: &AnalyzedDocument) -> CompletionRequest {
    let concepts = doc
        .concepts
        .iter()
        .take(MAX_CONCEPTS_PER_DOCUMENT)
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");
    CompletionRequest::new(format!(
        "Domain: {}\nDocument: {}\nKey findings: {}\n\nConcepts:\n{concepts}\n\n\
         For each concept, judge whether it is stated and used correctly, give a confidence \
         from 0.0 to 1.0, a one-sentence explanation and any corrections.\n\
         Answer with JSON only: {{\"validations\": [{{\"concept\": \"\", \"is_valid\": true, \
         \"confidence\": 0.0, \"explanation\": \"\", \"suggested_corrections\": []}}]}}",
        query.domain,
        doc.paper_title,
        doc.key_findings.join("; "),
    ))
    .with_system("You are a physics subject-matter expert reviewing concepts for accuracy.")
    .with_temperature(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(concepts: &[&str]) -> AnalyzedDocument {
        AnalyzedDocument {
            paper_title: "Teaching momentum".into(),
            key_findings: vec![],
            methodology: String::new(),
            results_summary: String::new(),
            limitations: vec![],
            concepts: concepts.iter().map(|c| c.to_string()).collect(),
            approaches: vec![],
            confidence: 0.8,
            fallback: false,
        }
    }

    fn verdict(concept: &str, valid: bool) -> Verdict {
        Verdict {
            concept: concept.into(),
            is_valid: valid,
            confidence: 1.4,
            explanation: String::new(),
            suggested_corrections: vec![],
        }
    }

    #[test]
    fn test_unrequested_and_repeated_verdicts_are_dropped() {
        let d = doc(&["Momentum", "Impulse"]);
        let out = verdicts_for(
            &d,
            vec![verdict("momentum", true), verdict("entropy", false), verdict("MOMENTUM", false)],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].concept, "Momentum");
        assert!(out[0].is_valid);
        assert_eq!(out[0].confidence, 1.0);
    }

    #[test]
    fn test_concepts_beyond_cap_are_not_accepted() {
        let concepts: Vec<String> = (0..10).map(|i| format!("c{i}")).collect();
        let refs: Vec<&str> = concepts.iter().map(String::as_str).collect();
        let out = verdicts_for(&doc(&refs), vec![verdict("c9", true), verdict("c7", true)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].concept, "c7");
    }
}
