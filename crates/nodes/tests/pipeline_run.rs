//! End-to-end runs of the default pipeline against fake sources and resources.

mod common;

use common::{config, executor, paper, CannedConnector, CannedProvider, StaticSource};
use pipeline::{ResearchQuery, RunStatus, StageStatus};
use pretty_assertions::assert_eq;

fn query(min: usize, max: usize) -> ResearchQuery {
    ResearchQuery::builder("How do hands-on labs improve optics learning?")
        .min_sources(min)
        .max_sources(max)
        .build()
        .unwrap()
}

fn status_of(outcome: &nodes::RunOutcome, stage: &str) -> Vec<StageStatus> {
    outcome
        .outcomes
        .iter()
        .filter(|o| o.stage.as_str() == stage)
        .map(|o| o.status)
        .collect()
}

#[tokio::test]
async fn test_three_sources_are_truncated_to_max_in_descending_order() {
    let provider = CannedProvider::new("fake", 9.0);
    let adapters = vec![
        StaticSource::returning("a", vec![paper("a", "A one", 10), paper("a", "A two", 60)]),
        StaticSource::returning("b", vec![paper("b", "B one", 20), paper("b", "B two", 50)]),
        StaticSource::returning("c", vec![paper("c", "C one", 30), paper("c", "C two", 40)]),
    ];
    let cfg = config(0);
    let outcome = executor(&cfg, CannedConnector::new(provider), adapters)
        .run_query(query(1, 3))
        .await
        .unwrap();

    let titles: Vec<_> = outcome.state.papers.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["A two", "B two", "C two"]);
    let scores: Vec<f64> = outcome.state.papers.iter().map(|p| p.relevance.as_f64()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(outcome.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_max_sources_alone_bounds_the_default_minimum() {
    let provider = CannedProvider::new("fake", 9.0);
    let adapters = vec![
        StaticSource::returning("a", vec![paper("a", "A one", 10), paper("a", "A two", 60)]),
        StaticSource::returning("b", vec![paper("b", "B one", 20), paper("b", "B two", 50)]),
        StaticSource::returning("c", vec![paper("c", "C one", 30), paper("c", "C two", 40)]),
    ];
    let query = ResearchQuery::builder("How do hands-on labs improve optics learning?")
        .max_sources(3)
        .build()
        .unwrap();
    let cfg = config(0);
    let outcome = executor(&cfg, CannedConnector::new(provider), adapters)
        .run_query(query)
        .await
        .unwrap();

    assert_eq!(outcome.state.papers.len(), 3);
    assert!(outcome
        .state
        .warnings
        .iter()
        .all(|w| !w.message.contains("fewer than the requested minimum")));
    assert_eq!(outcome.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_shortfall_keeps_all_documents_and_warns() {
    let provider = CannedProvider::new("fake", 9.0);
    let adapters = vec![StaticSource::returning(
        "a",
        vec![paper("a", "One", 1), paper("a", "Two", 2), paper("a", "Three", 3)],
    )];
    let cfg = config(0);
    let outcome = executor(&cfg, CannedConnector::new(provider), adapters)
        .run_query(query(5, 10))
        .await
        .unwrap();

    assert_eq!(outcome.state.papers.len(), 3);
    assert!(outcome
        .state
        .warnings
        .iter()
        .any(|w| w.message.contains("fewer than the requested minimum of 5")));
}

#[tokio::test]
async fn test_duplicate_doi_keeps_first_seen_record() {
    let provider = CannedProvider::new("fake", 9.0);
    let mut first = paper("a", "Optics labs", 5);
    first.doi = Some("10.1/X".into());
    let mut second = paper("b", "Optics Labs (preprint)", 500);
    second.doi = Some("https://doi.org/10.1/x".into());
    let adapters = vec![
        StaticSource::returning("a", vec![first]),
        StaticSource::returning("b", vec![second]),
    ];
    let cfg = config(0);
    let outcome = executor(&cfg, CannedConnector::new(provider), adapters)
        .run_query(query(1, 10))
        .await
        .unwrap();

    assert_eq!(outcome.state.papers.len(), 1);
    assert_eq!(outcome.state.papers[0].title, "Optics labs");
    assert_eq!(outcome.state.papers[0].source.as_str(), "a");
}

#[tokio::test]
async fn test_all_sources_failing_completes_with_error_and_skips_downstream() {
    let provider = CannedProvider::new("fake", 9.0);
    let adapters = vec![StaticSource::failing("a"), StaticSource::failing("b")];
    let cfg = config(0);
    let outcome = executor(&cfg, CannedConnector::new(provider), adapters)
        .run_query(query(1, 10))
        .await
        .unwrap();

    assert!(outcome.state.papers.is_empty());
    assert!(outcome
        .state
        .errors
        .iter()
        .any(|e| e.message == "all 2 literature sources failed"));
    assert_eq!(status_of(&outcome, "literature_search"), vec![StageStatus::Succeeded]);
    assert_eq!(status_of(&outcome, "document_analysis"), vec![StageStatus::Skipped]);
    assert_eq!(status_of(&outcome, "concept_validation"), vec![StageStatus::Skipped]);
    assert!(outcome
        .state
        .warnings
        .iter()
        .any(|w| w.message.starts_with("stage skipped")));
    assert!(outcome.status.is_terminal());
}

#[tokio::test]
async fn test_full_run_produces_passing_report() {
    let provider = CannedProvider::new("fake", 9.0);
    let adapters = vec![StaticSource::returning(
        "a",
        vec![paper("a", "Optics labs", 40), paper("a", "Lens models", 20)],
    )];
    let cfg = config(2);
    let outcome = executor(&cfg, CannedConnector::new(provider), adapters)
        .run_query(query(1, 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.analyzed_documents.len(), 2);
    assert!(!outcome.state.validations.is_empty());
    let report = outcome.state.report.as_ref().unwrap();
    assert_eq!(report.executive_summary, "Labs improve optics learning.");
    assert_eq!(report.references.len(), 2);
    let quality = outcome.state.quality.as_ref().unwrap();
    assert!(quality.passed);
    assert_eq!(outcome.state.rework_count, 0);
    assert!(outcome.state.errors.is_empty());
}

#[tokio::test]
async fn test_low_quality_triggers_revision_with_feedback() {
    let provider = CannedProvider::new("fake", 2.0);
    let adapters = vec![StaticSource::returning("a", vec![paper("a", "Optics labs", 40)])];
    let cfg = config(1);
    let outcome = executor(&cfg, CannedConnector::new(provider.clone()), adapters)
        .run_query(query(1, 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.rework_count, 1);
    assert_eq!(outcome.state.synthesis.as_ref().unwrap().revision, 1);
    assert_eq!(status_of(&outcome, "content_synthesis").len(), 2);
    assert!(!outcome.state.quality.as_ref().unwrap().passed);
    assert!(provider
        .prompts()
        .iter()
        .any(|p| p.contains("Broaden the evidence base.")));
    assert!(outcome
        .state
        .warnings
        .iter()
        .any(|w| w.message.contains("still below minimum")));
}

#[tokio::test]
async fn test_missing_primary_switches_to_alternate_and_records_substitution() {
    let provider = CannedProvider::new("fake", 9.0);
    let adapters = vec![StaticSource::returning("a", vec![paper("a", "Optics labs", 40)])];
    let cfg = config(0);
    let connector = CannedConnector::new(provider).without("deepseek_14b");
    let outcome = executor(&cfg, connector, adapters)
        .run_query(query(1, 10))
        .await
        .unwrap();

    assert_eq!(outcome.state.analyzed_documents.len(), 1);
    assert!(!outcome.state.analyzed_documents[0].fallback);
    let usage = outcome
        .state
        .resources
        .iter()
        .find(|r| r.stage.as_str() == "document_analysis")
        .unwrap();
    assert_eq!(usage.resource.as_str(), "qwen_coder_14b");
    assert!(usage.substituted);
    assert!(usage.reason.as_deref().unwrap().contains("deepseek_14b"));
}
