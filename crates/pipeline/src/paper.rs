//! Candidate documents produced by literature source adapters.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{RelevanceScore, SourceName};

/// A candidate document (paper) returned by a source adapter.
///
/// Created during retrieval. The relevance score and keyword tags are
/// updated by the ranking step; after the retrieval stage commits, a paper
/// is never modified again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub title: String,
    pub authors: Vec<String>,
    /// Abstract text.
    pub summary: String,
    /// Canonical landing page.
    pub url: String,
    /// Direct link to the document body, when the source provides one.
    pub pdf_url: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub published: Option<NaiveDate>,
    pub venue: Option<String>,
    pub citations: u64,
    pub relevance: RelevanceScore,
    /// Which adapter produced the record.
    pub source: SourceName,
    /// Free-form keyword tags; ranking appends LLM-identified concepts here.
    pub keywords: Vec<String>,
}

impl Paper {
    /// Creates a paper with only the mandatory metadata set.
    pub fn new(title: impl Into<String>, source: SourceName) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            summary: String::new(),
            url: String::new(),
            pdf_url: None,
            doi: None,
            arxiv_id: None,
            published: None,
            venue: None,
            citations: 0,
            relevance: RelevanceScore::default(),
            source,
            keywords: Vec::new(),
        }
    }

    /// Publication year, if the publication date is known.
    pub fn year(&self) -> Option<i32> {
        self.published.map(|d| d.year())
    }

    /// DOI with resolver prefixes removed, trimmed and lower-cased.
    ///
    /// Returns `None` when the paper has no DOI or the DOI is blank.
    pub fn normalized_doi(&self) -> Option<String> {
        self.doi.as_deref().and_then(normalize_doi)
    }

    /// Title lower-cased with punctuation stripped and whitespace collapsed.
    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }

    /// Case-insensitive substring test against title and abstract.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        self.title.to_lowercase().contains(&needle) || self.summary.to_lowercase().contains(&needle)
    }
}

const DOI_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
];

/// Normalizes a DOI string for equality comparison.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim().to_lowercase();
    for prefix in DOI_PREFIXES {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim().to_string();
            break;
        }
    }
    (!doi.is_empty()).then_some(doi)
}

/// Normalizes a title for equality comparison.
///
/// Keeps alphanumerics, underscores and whitespace, then collapses runs of
/// whitespace into single spaces.
pub fn normalize_title(raw: &str) -> String {
    let kept: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}
