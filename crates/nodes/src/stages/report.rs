//! Assembly of the final research report.
//!
//! Section bodies are built deterministically from the state; the compute
//! resource only writes the executive summary, recommendations and
//! conclusion, each of which has a deterministic fallback.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    CompletionRequest, InsightKind, OutputSlot, Paper, PipelineState, Precondition, ReportSection,
    ResearchReport, Stage, StageCommit, StageContext, StageFailure, StageName, StageOutput,
    Timestamp,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::excerpt;
use crate::gateway::{InvocationFailure, LlmGateway};

pub struct ReportGenerationStage {
    name: StageName,
    gateway: Arc<LlmGateway>,
}

impl ReportGenerationStage {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            name: StageName::from_static(pipeline::stage::names::REPORT_GENERATION),
            gateway,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NarrativeResponse {
    executive_summary: String,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    conclusion: String,
}

#[async_trait]
impl Stage for ReportGenerationStage {
    fn name(&self) -> &StageName {
        &self.name
    }

    fn output_slot(&self) -> OutputSlot {
        OutputSlot::Report
    }

    fn precondition(&self, state: &PipelineState) -> Precondition {
        Precondition::require(!state.papers.is_empty(), "no documents to report on")
    }

    async fn execute(&self, state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
        let gateway = self.gateway.for_stage(&self.name);
        let mut warnings = Vec::new();

        let narrative = match gateway
            .complete_json::<NarrativeResponse>(narrative_request(state), &ctx.cancel)
            .await
        {
            Ok(n) if !n.executive_summary.trim().is_empty() => n,
            Ok(_) => {
                warnings.push("report narrative was empty; using generated summary".to_string());
                fallback_narrative(state)
            }
            Err(InvocationFailure::Cancelled) => return Err(StageFailure::Cancelled),
            Err(failure) => {
                warn!(error = %failure, "Report narrative call failed; using generated summary");
                warnings.push(format!("report narrative fell back to a generated summary: {failure}"));
                fallback_narrative(state)
            }
        };

        let report = build_report(state, narrative, ctx.rework);
        info!(
            sections = report.sections.len(),
            references = report.references.len(),
            words = report.word_count,
            "Report generated"
        );
        let resources = gateway.usage().await.into_iter().collect();
        Ok(StageCommit::new(StageOutput::Report(report))
            .with_warnings(warnings)
            .with_resources(resources))
    }
}

fn narrative_request(state: &PipelineState) -> CompletionRequest {
    let mut prompt = format!(
        "Research question: {}\nDomain: {}\nDocuments reviewed: {}\n",
        state.query.question,
        state.query.domain,
        state.papers.len()
    );
    if let Some(synthesis) = &state.synthesis {
        prompt.push_str(&format!("\nSynthesis: {}\n", excerpt(&synthesis.summary, 1500)));
        for insight in synthesis.insights.iter().take(8) {
            prompt.push_str(&format!("- [{:?}] {}: {}\n", insight.kind, insight.title, insight.description));
        }
    }
    prompt.push_str(
        "\nWrite an executive summary of two or three paragraphs, a list of practical \
         recommendations and a short conclusion.\nAnswer with JSON only: \
         {\"executive_summary\": \"\", \"recommendations\": [], \"conclusion\": \"\"}",
    );
    CompletionRequest::new(prompt)
        .with_system("You are an academic writer preparing a research report for educators.")
}

fn fallback_narrative(state: &PipelineState) -> NarrativeResponse {
    let mut summary = format!(
        "This report reviews {} document(s) addressing the question: {}",
        state.papers.len(),
        state.query.question
    );
    if let Some(synthesis) = &state.synthesis {
        summary.push_str("\n\n");
        summary.push_str(&synthesis.summary);
    }
    let recommendations = state
        .synthesis
        .iter()
        .flat_map(|s| &s.insights)
        .filter(|i| i.kind == InsightKind::Gap)
        .map(|i| format!("Investigate: {}", i.title))
        .collect();
    NarrativeResponse {
        executive_summary: summary,
        recommendations,
        conclusion: format!(
            "The reviewed literature provides a starting point for answering: {}",
            state.query.question
        ),
    }
}

fn build_report(state: &PipelineState, narrative: NarrativeResponse, revision: u32) -> ResearchReport {
    let mut sections = vec![
        ReportSection {
            heading: "Introduction".into(),
            body: format!(
                "Research question: {}\n\nDomain: {}. {} document(s) were selected from {} source(s).",
                state.query.question,
                state.query.domain,
                state.papers.len(),
                distinct_sources(&state.papers),
            ),
        },
        ReportSection {
            heading: "Literature Review".into(),
            body: literature_review(state),
        },
    ];

    if let Some(synthesis) = &state.synthesis {
        let mut body = synthesis.summary.clone();
        for insight in &synthesis.insights {
            body.push_str(&format!(
                "\n\n**{}** ({}, confidence {:.2}): {}",
                insight.title,
                kind_label(insight.kind),
                insight.confidence,
                insight.description
            ));
        }
        sections.push(ReportSection {
            heading: "Key Findings".into(),
            body,
        });
    }

    if !state.validations.is_empty() {
        let valid = state.validations.iter().filter(|v| v.is_valid).count();
        let mut body = format!(
            "{valid} of {} concept(s) were confirmed as correctly used.",
            state.validations.len()
        );
        for v in state.validations.iter().filter(|v| !v.is_valid) {
            body.push_str(&format!("\n- {} in '{}': {}", v.concept, v.document, v.explanation));
        }
        sections.push(ReportSection {
            heading: "Concept Validation".into(),
            body,
        });
    }

    if !narrative.recommendations.is_empty() {
        sections.push(ReportSection {
            heading: "Recommendations".into(),
            body: narrative
                .recommendations
                .iter()
                .map(|r| format!("- {r}"))
                .collect::<Vec<_>>()
                .join("\n"),
        });
    }

    let limitations = limitations(state);
    if !limitations.is_empty() {
        sections.push(ReportSection {
            heading: "Limitations".into(),
            body: limitations,
        });
    }

    if !narrative.conclusion.trim().is_empty() {
        sections.push(ReportSection {
            heading: "Conclusion".into(),
            body: narrative.conclusion,
        });
    }

    let word_count = ResearchReport::count_words(&narrative.executive_summary, &sections);
    ResearchReport {
        title: format!("Research Report: {}", state.query.question),
        executive_summary: narrative.executive_summary,
        sections,
        references: state.papers.iter().map(format_reference).collect(),
        word_count,
        generated_at: Timestamp::now(),
        revision,
    }
}

fn literature_review(state: &PipelineState) -> String {
    state
        .papers
        .iter()
        .enumerate()
        .map(|(i, paper)| {
            let analysis = state
                .analyzed_documents
                .iter()
                .find(|d| d.paper_title == paper.title);
            let detail = match analysis {
                Some(doc) if !doc.key_findings.is_empty() => doc.key_findings.join(" "),
                Some(doc) => doc.results_summary.clone(),
                None => excerpt(&paper.summary, 300),
            };
            format!("[{}] **{}** (relevance {}): {}", i + 1, paper.title, paper.relevance, detail)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn limitations(state: &PipelineState) -> String {
    let mut lines = Vec::new();
    if state.papers.len() < state.query.min_sources {
        lines.push(format!(
            "- Only {} document(s) were available; {} were requested at minimum.",
            state.papers.len(),
            state.query.min_sources
        ));
    }
    let fallbacks = state.analyzed_documents.iter().filter(|d| d.fallback).count();
    if fallbacks > 0 {
        lines.push(format!(
            "- {fallbacks} document(s) could not be fully analysed and are summarised from their abstracts."
        ));
    }
    if !state.errors.is_empty() {
        lines.push(format!("- {} error(s) were recorded during the run.", state.errors.len()));
    }
    lines.join("\n")
}

fn distinct_sources(papers: &[Paper]) -> usize {
    let mut names: Vec<&str> = papers.iter().map(|p| p.source.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    names.len()
}

fn kind_label(kind: InsightKind) -> &'static str {
    match kind {
        InsightKind::Pattern => "pattern",
        InsightKind::Contradiction => "contradiction",
        InsightKind::Gap => "research gap",
        InsightKind::Evidence => "evidence",
        InsightKind::Trend => "trend",
    }
}

/// `Authors (Year). Title. Venue. DOI/URL`
pub fn format_reference(paper: &Paper) -> String {
    let authors = match paper.authors.len() {
        0 => "Unknown author".to_string(),
        1..=3 => paper.authors.join(", "),
        _ => format!("{} et al.", paper.authors[0]),
    };
    let year = paper
        .year()
        .map_or_else(|| "(Year unknown)".to_string(), |y| format!("({y})"));
    let mut reference = format!("{authors} {year}. {}.", paper.title);
    if let Some(venue) = paper.venue.as_deref().filter(|v| !v.is_empty()) {
        reference.push_str(&format!(" {venue}."));
    }
    if let Some(doi) = &paper.doi {
        reference.push_str(&format!(" DOI: {doi}"));
    } else if !paper.url.is_empty() {
        reference.push_str(&format!(" Available: {}", paper.url));
    }
    reference
}
