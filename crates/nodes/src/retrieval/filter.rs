//! Final selection of the ranked candidates.

use pipeline::{Paper, ResearchQuery};

/// Documents chosen for the run plus an optional shortfall warning.
#[derive(Debug)]
pub struct Selection {
    pub papers: Vec<Paper>,
    pub warning: Option<String>,
}

/// Applies the relevance threshold, preferred years, exclude keywords and
/// the `[min_sources, max_sources]` bounds to an already ranked list.
///
/// When fewer than `min_sources` survive, filtered documents are re-admitted
/// best ranked first: those failing only the threshold or the year filter
/// before exclude-keyword matches. The result keeps the ranked order.
pub fn select(ranked: Vec<Paper>, query: &ResearchQuery, min_relevance: f64) -> Selection {
    let max = query.max_sources;
    let min = query.min_sources.min(max);

    let mut chosen = vec![false; ranked.len()];
    let mut relaxable = Vec::new();
    let mut excluded = Vec::new();
    let mut count = 0;

    for (i, paper) in ranked.iter().enumerate() {
        if query.exclude_keywords.iter().any(|k| paper.mentions(k)) {
            excluded.push(i);
            continue;
        }
        let below_threshold = paper.relevance.as_f64() < min_relevance;
        let outside_years = match (query.preferred_years, paper.year()) {
            (Some(range), Some(year)) => !range.contains(year),
            _ => false,
        };
        if below_threshold || outside_years {
            relaxable.push(i);
        } else if count < max {
            chosen[i] = true;
            count += 1;
        }
    }

    for i in relaxable.into_iter().chain(excluded) {
        if count >= min {
            break;
        }
        chosen[i] = true;
        count += 1;
    }

    let papers: Vec<Paper> = ranked
        .into_iter()
        .zip(chosen)
        .filter_map(|(paper, keep)| keep.then_some(paper))
        .collect();

    let warning = (papers.len() < query.min_sources).then(|| {
        format!(
            "only {} document(s) available, fewer than the requested minimum of {}",
            papers.len(),
            query.min_sources
        )
    });
    Selection { papers, warning }
}
