//! Duplicate removal across sources.

use std::collections::{HashMap, HashSet};

use pipeline::Paper;

/// Removes duplicates, keeping the first-seen copy.
///
/// Two documents are duplicates when both carry a DOI and the normalised DOIs
/// match, or when at most one carries a DOI and the normalised titles match.
/// Documents with different DOIs are never duplicates, whatever their titles.
pub fn deduplicate(papers: Vec<Paper>) -> Vec<Paper> {
    let mut dois: HashSet<String> = HashSet::new();
    // title -> DOIs of the kept documents with that title
    let mut titles: HashMap<String, Vec<Option<String>>> = HashMap::new();
    let mut kept = Vec::with_capacity(papers.len());

    for paper in papers {
        let doi = paper.normalized_doi();
        let title = paper.normalized_title();

        if let Some(d) = &doi {
            if dois.contains(d) {
                continue;
            }
        }
        if !title.is_empty() {
            let same_title = titles.get(&title).is_some_and(|existing| {
                existing.iter().any(|other| other.is_none() || doi.is_none())
            });
            if same_title {
                continue;
            }
        }

        if let Some(d) = &doi {
            dois.insert(d.clone());
        }
        if !title.is_empty() {
            titles.entry(title).or_default().push(doi);
        }
        kept.push(paper);
    }
    kept
}
