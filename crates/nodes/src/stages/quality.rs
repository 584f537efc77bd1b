//! The quality gate at the end of the pipeline.
//!
//! The overall score weighs three components:
//!
//! | Component | Weight | Source |
//! |-----------|--------|--------|
//! | Aspect mean | 0.5 | LLM scores for five aspects on a 0–10 scale |
//! | Completeness | 0.3 | Six-item research checklist |
//! | Citation coverage | 0.2 | Share of selected documents cited by the report |
//!
//! A failed aspect assessment contributes zero and leaves a warning.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    AspectScores, CompletionRequest, OutputSlot, PipelineState, Precondition, QualityAssessment,
    QualityLevel, QualityScore, ResearchReport, Stage, StageCommit, StageContext, StageFailure,
    StageName, StageOutput,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::excerpt;
use crate::gateway::{InvocationFailure, LlmGateway};

const ASPECT_WEIGHT: f64 = 0.5;
const COMPLETENESS_WEIGHT: f64 = 0.3;
const COVERAGE_WEIGHT: f64 = 0.2;

/// Aspect scores below this (0–10 scale) produce a recommendation.
const RECOMMENDATION_THRESHOLD: f64 = 7.0;

pub struct QualityControlStage {
    name: StageName,
    gateway: Arc<LlmGateway>,
    min_quality_score: f64,
}

impl QualityControlStage {
    pub fn new(gateway: Arc<LlmGateway>, min_quality_score: f64) -> Self {
        Self {
            name: StageName::from_static(pipeline::stage::names::QUALITY_CONTROL),
            gateway,
            min_quality_score,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AspectResponse {
    literature: f64,
    analysis: f64,
    validation: f64,
    synthesis: f64,
    report: f64,
    #[serde(default)]
    feedback: String,
}

#[async_trait]
impl Stage for QualityControlStage {
    fn name(&self) -> &StageName {
        &self.name
    }

    fn output_slot(&self) -> OutputSlot {
        OutputSlot::Quality
    }

    fn precondition(&self, state: &PipelineState) -> Precondition {
        Precondition::require(state.report.is_some(), "no report to assess")
    }

    async fn execute(&self, state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
        let Some(report) = &state.report else {
            return Err(StageFailure::Fault {
                message: "report missing at quality control".into(),
            });
        };
        let gateway = self.gateway.for_stage(&self.name);
        let mut warnings = Vec::new();

        let (aspects, llm_feedback) = match gateway
            .complete_json::<AspectResponse>(aspect_request(state, report), &ctx.cancel)
            .await
        {
            Ok(r) => (
                Some(AspectScores {
                    literature: r.literature,
                    analysis: r.analysis,
                    validation: r.validation,
                    synthesis: r.synthesis,
                    report: r.report,
                }),
                Some(r.feedback).filter(|f| !f.trim().is_empty()),
            ),
            Err(InvocationFailure::Cancelled) => return Err(StageFailure::Cancelled),
            Err(failure) => {
                warn!(error = %failure, "Aspect assessment failed; scoring without it");
                warnings.push(format!("aspect assessment unavailable, counted as zero: {failure}"));
                (None, None)
            }
        };

        let assessment = assess(state, report, aspects, llm_feedback, self.min_quality_score);
        info!(
            overall = assessment.overall.as_f64(),
            level = ?assessment.level,
            passed = assessment.passed,
            "Quality assessment finished"
        );
        let resources = gateway.usage().await.into_iter().collect();
        Ok(StageCommit::new(StageOutput::Quality(assessment))
            .with_warnings(warnings)
            .with_resources(resources))
    }
}

/// The six research checklist items and whether each was completed.
pub fn checklist(state: &PipelineState) -> [(&'static str, bool); 6] {
    [
        ("research question", !state.query.question.trim().is_empty()),
        ("literature search", !state.papers.is_empty()),
        ("document analysis", !state.analyzed_documents.is_empty()),
        ("concept validation", !state.validations.is_empty()),
        (
            "content synthesis",
            state.synthesis.as_ref().is_some_and(|s| !s.insights.is_empty()),
        ),
        ("report generation", state.report.is_some()),
    ]
}

/// Share of selected documents whose title appears in a report reference.
pub fn citation_coverage(state: &PipelineState, report: &ResearchReport) -> f64 {
    if state.papers.is_empty() {
        return 0.0;
    }
    let cited = state
        .papers
        .iter()
        .filter(|p| report.references.iter().any(|r| r.contains(p.title.as_str())))
        .count();
    cited as f64 / state.papers.len() as f64
}

fn assess(
    state: &PipelineState,
    report: &ResearchReport,
    aspects: Option<AspectScores>,
    llm_feedback: Option<String>,
    min_quality_score: f64,
) -> QualityAssessment {
    let items = checklist(state);
    let completed = items.iter().filter(|(_, done)| *done).count();
    let completeness = completed as f64 / items.len() as f64;
    let coverage = citation_coverage(state, report);
    let aspect_mean = aspects.map_or(0.0, |a| a.normalized_mean());

    let overall = QualityScore::clamped(
        ASPECT_WEIGHT * aspect_mean + COMPLETENESS_WEIGHT * completeness + COVERAGE_WEIGHT * coverage,
    );

    let mut recommendations: Vec<String> = items
        .iter()
        .filter(|(_, done)| !done)
        .map(|(item, _)| format!("Complete the missing {item} step"))
        .collect();
    if let Some(a) = &aspects {
        recommendations.extend(aspect_recommendations(a));
    }
    if coverage < 1.0 && !state.papers.is_empty() {
        recommendations.push("Cite every selected document in the report".to_string());
    }

    let feedback = llm_feedback.unwrap_or_else(|| {
        if recommendations.is_empty() {
            format!("Overall quality {overall}; no specific issues identified.")
        } else {
            format!("Overall quality {overall}. {}.", recommendations.join(". "))
        }
    });

    QualityAssessment {
        overall,
        level: QualityLevel::from_score(overall),
        completeness,
        citation_coverage: coverage,
        aspects,
        feedback,
        recommendations,
        passed: overall.meets(min_quality_score),
    }
}

fn aspect_recommendations(aspects: &AspectScores) -> Vec<String> {
    [
        (aspects.literature, "Expand literature search to include more recent and diverse sources"),
        (aspects.analysis, "Improve document analysis depth and extraction accuracy"),
        (aspects.validation, "Enhance physics concept validation and accuracy checking"),
        (aspects.synthesis, "Strengthen cross-study analysis and pattern identification"),
        (aspects.report, "Improve report structure, clarity, and professional presentation"),
    ]
    .into_iter()
    .filter(|(score, _)| *score < RECOMMENDATION_THRESHOLD)
    .map(|(_, text)| text.to_string())
    .collect()
}

fn aspect_request(state: &PipelineState, report: &ResearchReport) -> CompletionRequest {
    let valid = state.validations.iter().filter(|v| v.is_valid).count();
    let insights = state.synthesis.as_ref().map_or(0, |s| s.insights.len());
    CompletionRequest::new(format!(
        "Research question: {}\n\nRun summary:\n- documents selected: {}\n- documents analysed: {}\n\
         - concepts validated: {} ({valid} valid)\n- synthesis insights: {insights}\n\
         - report words: {}\n\nExecutive summary:\n{}\n\n\
         Score each aspect from 0 to 10: literature coverage, analysis depth, concept validation, \
         synthesis quality and report quality. Give one paragraph of actionable feedback.\n\
         Answer with JSON only: {{\"literature\": 0, \"analysis\": 0, \"validation\": 0, \
         \"synthesis\": 0, \"report\": 0, \"feedback\": \"\"}}",
        state.query.question,
        state.papers.len(),
        state.analyzed_documents.len(),
        state.validations.len(),
        report.word_count,
        excerpt(&report.executive_summary, 1500),
    ))
    .with_system("You are a strict reviewer assessing the quality of a research report.")
    .with_temperature(0.1)
}
