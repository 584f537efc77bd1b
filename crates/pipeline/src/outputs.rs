//! Typed output records of the downstream stages.
//!
//! Each stage owns exactly one output slot in [`crate::PipelineState`]; the
//! records here are what those slots hold.

use serde::{Deserialize, Serialize};

use crate::{QualityScore, Timestamp};

// ---------------------------------------------------------------------------
// Document analysis
// ---------------------------------------------------------------------------

/// Structured analysis of one candidate document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedDocument {
    /// Title of the analysed paper; links back to `PipelineState::papers`.
    pub paper_title: String,
    pub key_findings: Vec<String>,
    pub methodology: String,
    pub results_summary: String,
    pub limitations: Vec<String>,
    /// Domain concepts mentioned by the document.
    pub concepts: Vec<String>,
    /// Pedagogical or experimental approaches described.
    pub approaches: Vec<String>,
    /// Analyst confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// `true` when the analysis call failed and this record was derived from
    /// the abstract alone.
    pub fallback: bool,
}

// ---------------------------------------------------------------------------
// Concept validation
// ---------------------------------------------------------------------------

/// Validation verdict for one concept of one analysed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Title of the document the concept came from.
    pub document: String,
    pub concept: String,
    pub is_valid: bool,
    pub confidence: f64,
    pub explanation: String,
    #[serde(default)]
    pub suggested_corrections: Vec<String>,
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Classification of a cross-document insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Pattern,
    Contradiction,
    Gap,
    Evidence,
    Trend,
}

/// One insight drawn across several documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInsight {
    pub kind: InsightKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
    pub confidence: f64,
    /// Titles of the documents the insight draws on.
    #[serde(default)]
    pub related_documents: Vec<String>,
}

/// Output of the synthesis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub summary: String,
    pub insights: Vec<SynthesisInsight>,
    /// Revision pass that produced this synthesis (0 for the first pass).
    pub revision: u32,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub heading: String,
    pub body: String,
}

/// The structured research report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub title: String,
    pub executive_summary: String,
    pub sections: Vec<ReportSection>,
    /// Formatted reference entries, one per cited document.
    pub references: Vec<String>,
    pub word_count: usize,
    pub generated_at: Timestamp,
    pub revision: u32,
}

impl ResearchReport {
    /// Counts words across the summary and all section bodies.
    pub fn count_words(executive_summary: &str, sections: &[ReportSection]) -> usize {
        executive_summary.split_whitespace().count()
            + sections
                .iter()
                .map(|s| s.body.split_whitespace().count())
                .sum::<usize>()
    }

    /// Renders the report as a markdown document.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n", self.title);
        out.push_str("## Executive Summary\n\n");
        out.push_str(self.executive_summary.trim());
        out.push_str("\n\n");
        for section in &self.sections {
            out.push_str(&format!("## {}\n\n{}\n\n", section.heading, section.body.trim()));
        }
        if !self.references.is_empty() {
            out.push_str("## References\n\n");
            for (i, reference) in self.references.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, reference));
            }
            out.push('\n');
        }
        out.push_str(&format!(
            "---\n*Generated {} ({} words, revision {})*\n",
            self.generated_at, self.word_count, self.revision
        ));
        out
    }
}

// ---------------------------------------------------------------------------
// Quality control
// ---------------------------------------------------------------------------

/// Quality band derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Excellent,
    VeryGood,
    Good,
    Satisfactory,
    NeedsImprovement,
    Poor,
}

impl QualityLevel {
    pub fn from_score(score: QualityScore) -> Self {
        match score.as_f64() {
            s if s >= 0.9 => Self::Excellent,
            s if s >= 0.8 => Self::VeryGood,
            s if s >= 0.7 => Self::Good,
            s if s >= 0.6 => Self::Satisfactory,
            s if s >= 0.4 => Self::NeedsImprovement,
            _ => Self::Poor,
        }
    }
}

/// LLM-assessed aspect scores on a 0–10 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AspectScores {
    pub literature: f64,
    pub analysis: f64,
    pub validation: f64,
    pub synthesis: f64,
    pub report: f64,
}

impl AspectScores {
    /// Mean aspect score normalised to `[0.0, 1.0]`.
    pub fn normalized_mean(&self) -> f64 {
        let sum = [self.literature, self.analysis, self.validation, self.synthesis, self.report]
            .iter()
            .map(|s| s.clamp(0.0, 10.0))
            .sum::<f64>();
        sum / 50.0
    }
}

/// Output of the quality-control stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub overall: QualityScore,
    pub level: QualityLevel,
    /// Fraction of the research checklist that was completed.
    pub completeness: f64,
    /// Fraction of retrieved documents cited by the report.
    pub citation_coverage: f64,
    /// `None` when the aspect assessment call failed.
    pub aspects: Option<AspectScores>,
    pub feedback: String,
    pub recommendations: Vec<String>,
    /// Whether `overall` reached the configured minimum quality score.
    pub passed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_level_bands() {
        let level = |v: f64| QualityLevel::from_score(QualityScore::clamped(v));
        assert_eq!(level(0.95), QualityLevel::Excellent);
        assert_eq!(level(0.8), QualityLevel::VeryGood);
        assert_eq!(level(0.75), QualityLevel::Good);
        assert_eq!(level(0.6), QualityLevel::Satisfactory);
        assert_eq!(level(0.45), QualityLevel::NeedsImprovement);
        assert_eq!(level(0.1), QualityLevel::Poor);
    }

    #[test]
    fn test_markdown_lists_sections_and_numbered_references() {
        let sections = vec![ReportSection {
            heading: "Findings".into(),
            body: "Students improve with peer instruction.".into(),
        }];
        let report = ResearchReport {
            title: "Peer Instruction".into(),
            executive_summary: "Short summary.".into(),
            word_count: ResearchReport::count_words("Short summary.", &sections),
            sections,
            references: vec!["Mazur (1997). Peer Instruction.".into()],
            generated_at: Timestamp::now(),
            revision: 0,
        };
        let md = report.to_markdown();
        assert!(md.starts_with("# Peer Instruction"));
        assert!(md.contains("## Findings"));
        assert!(md.contains("1. Mazur (1997)"));
        assert_eq!(report.word_count, 7);
    }

    #[test]
    fn test_aspect_mean_clamps_out_of_scale_values() {
        let aspects = AspectScores {
            literature: 10.0,
            analysis: 12.0,
            validation: 5.0,
            synthesis: 5.0,
            report: -1.0,
        };
        assert!((aspects.normalized_mean() - 0.6).abs() < 1e-9);
    }
}
