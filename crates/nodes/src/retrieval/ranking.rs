//! Hybrid ranking: a call-free heuristic for every candidate, replaced by an
//! LLM relevance judgment for the top-K.

use std::cmp::Ordering;

use pipeline::{CompletionRequest, Paper, RelevanceScore, ResearchQuery, RetrievalSettings};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{InvocationFailure, StageGateway};

/// Largest citation component of the heuristic score.
const MAX_CITATION_COMPONENT: f64 = 0.5;
const RECENT_BONUS: f64 = 0.3;
const OLDER_BONUS: f64 = 0.1;
const BASE_SCORE: f64 = 0.2;

/// Heuristic relevance in `[0.2, 1.0]` from citations and recency.
///
/// A paper is recent when published within `recency_window_years` of
/// `reference_year`; unknown dates get the smaller bonus.
pub fn heuristic_score(paper: &Paper, settings: &RetrievalSettings, reference_year: i32) -> RelevanceScore {
    let normalizer = settings.citation_normalizer.max(1) as f64;
    let citations = (paper.citations as f64 / normalizer).min(MAX_CITATION_COMPONENT);
    let recency = match paper.year() {
        Some(year) if year >= reference_year - settings.recency_window_years => RECENT_BONUS,
        _ => OLDER_BONUS,
    };
    RelevanceScore::clamped(citations + recency + BASE_SCORE)
}

/// Final ordering: score descending, then citations descending, then
/// first-seen order (the sort is stable).
pub fn sort_ranked(papers: &mut [Paper]) {
    papers.sort_by(compare_ranked);
}

fn compare_ranked(a: &Paper, b: &Paper) -> Ordering {
    b.relevance
        .total_cmp(&a.relevance)
        .then_with(|| b.citations.cmp(&a.citations))
}

#[derive(Debug, Deserialize)]
struct RelevanceJudgment {
    index: usize,
    score: f64,
    #[serde(default)]
    concepts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RelevanceResponse {
    scores: Vec<RelevanceJudgment>,
}

/// Outcome of ranking.
#[derive(Debug)]
pub struct Ranked {
    pub papers: Vec<Paper>,
    pub warning: Option<String>,
}

/// Scores and orders `papers`.
///
/// Every candidate gets the heuristic score. The top `rerank_top_k` by
/// heuristic are then judged by the compute resource; candidates without a
/// judgment keep their heuristic score. A failed judgment call only produces a
/// warning. Cancellation is propagated.
pub async fn rank(
    mut papers: Vec<Paper>,
    query: &ResearchQuery,
    settings: &RetrievalSettings,
    reference_year: i32,
    gateway: &StageGateway,
    cancel: &CancellationToken,
) -> Result<Ranked, InvocationFailure> {
    for paper in &mut papers {
        paper.relevance = heuristic_score(paper, settings, reference_year);
    }
    sort_ranked(&mut papers);

    let top_k = settings.rerank_top_k.min(papers.len());
    if top_k == 0 {
        return Ok(Ranked { papers, warning: None });
    }

    let request = CompletionRequest::new(relevance_prompt(query, &papers[..top_k]))
        .with_system("You are an expert reviewer judging the relevance of academic papers to a research question.");

    let warning = match gateway.complete_json::<RelevanceResponse>(request, cancel).await {
        Ok(response) => {
            let mut judged = 0;
            for judgment in response.scores {
                let Some(paper) = papers[..top_k].get_mut(judgment.index) else {
                    continue;
                };
                paper.relevance = RelevanceScore::clamped(judgment.score);
                for concept in judgment.concepts {
                    let concept = concept.trim();
                    if !concept.is_empty() && !paper.keywords.iter().any(|k| k.eq_ignore_ascii_case(concept)) {
                        paper.keywords.push(concept.to_string());
                    }
                }
                judged += 1;
            }
            debug!(judged, top_k, "Applied LLM relevance judgments");
            None
        }
        Err(InvocationFailure::Cancelled) => return Err(InvocationFailure::Cancelled),
        Err(failure) => {
            warn!(error = %failure, "Relevance judgment failed; keeping heuristic scores");
            Some(format!("relevance judgment failed, heuristic scores kept: {failure}"))
        }
    };

    sort_ranked(&mut papers);
    Ok(Ranked { papers, warning })
}

fn relevance_prompt(query: &ResearchQuery, candidates: &[Paper]) -> String {
    let mut prompt = format!(
        "Research question: {}\nDomain: {}\n\nRate each paper's relevance to the question \
         from 0.0 to 1.0 and list the key domain concepts it covers.\n\n",
        query.question, query.domain
    );
    for (i, paper) in candidates.iter().enumerate() {
        let authors = paper.authors.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
        let more = if paper.authors.len() > 3 { ", ..." } else { "" };
        let summary: String = paper.summary.chars().take(300).collect();
        let year = paper.year().map_or_else(|| "unknown".to_string(), |y| y.to_string());
        prompt.push_str(&format!(
            "[{i}] {}\nAuthors: {authors}{more}\nYear: {year}\nCitations: {}\nAbstract: {summary}\n\n",
            paper.title, paper.citations
        ));
    }
    prompt.push_str(
        "Answer with JSON only: {\"scores\": [{\"index\": 0, \"score\": 0.0, \"concepts\": [\"...\"]}]}",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pipeline::SourceName;
    use proptest::prelude::*;

    fn paper(title: &str, citations: u64, year: Option<i32>) -> Paper {
        let mut p = Paper::new(title, SourceName::from_static("test"));
        p.citations = citations;
        p.published = year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1));
        p
    }

    #[test]
    fn test_heuristic_components() {
        let settings = RetrievalSettings::default();
        let score = |p: &Paper| heuristic_score(p, &settings, 2025).as_f64();
        assert!((score(&paper("a", 0, None)) - 0.3).abs() < 1e-9);
        assert!((score(&paper("b", 50, Some(2024))) - 1.0).abs() < 1e-9);
        assert!((score(&paper("c", 10_000, Some(2001))) - 0.8).abs() < 1e-9);
        assert!((score(&paper("d", 20, Some(2020))) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_ties_break_on_citations_then_first_seen() {
        let mut papers = vec![paper("first", 5, None), paper("second", 9, None), paper("third", 5, None)];
        for p in &mut papers {
            p.relevance = RelevanceScore::clamped(0.5);
        }
        sort_ranked(&mut papers);
        let titles: Vec<_> = papers.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first", "third"]);
    }

    proptest! {
        /// With heuristic scores only, more citations at the same recency never rank lower.
        #[test]
        fn prop_heuristic_rank_is_monotone_in_citations(
            citations in prop::collection::vec(0u64..400, 1..20),
            recent in any::<bool>(),
        ) {
            let settings = RetrievalSettings::default();
            let year = if recent { Some(2024) } else { Some(1999) };
            let mut papers: Vec<Paper> = citations
                .iter()
                .enumerate()
                .map(|(i, c)| paper(&format!("p{i}"), *c, year))
                .collect();
            for p in &mut papers {
                p.relevance = heuristic_score(p, &settings, 2025);
            }
            sort_ranked(&mut papers);
            for pair in papers.windows(2) {
                prop_assert!(pair[0].relevance.as_f64() >= pair[1].relevance.as_f64());
                prop_assert!(pair[0].citations >= pair[1].citations);
            }
        }
    }
}
