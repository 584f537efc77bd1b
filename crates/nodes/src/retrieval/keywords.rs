//! Search-term derivation and LLM keyword expansion.

use pipeline::{CompletionRequest, ResearchQuery};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{InvocationFailure, StageGateway};

/// Words of at least four characters from the question, lower-cased, in
/// order of appearance and without repeats.
pub fn question_terms(question: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in question
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 4)
    {
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}

/// Merges expanded keywords with the user's, dropping very short or blank
/// entries and case-insensitive repeats, keeping first occurrences, capped at
/// `cap`.
pub fn merge_keywords(expanded: &[String], user: &[String], cap: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let candidates = expanded
        .iter()
        .map(|k| k.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|k| k.chars().count() > 2)
        .chain(user.iter().map(|k| k.trim()).filter(|k| !k.is_empty()));
    for keyword in candidates {
        if merged.len() >= cap {
            break;
        }
        if !merged.iter().any(|m| m.eq_ignore_ascii_case(keyword)) {
            merged.push(keyword.to_string());
        }
    }
    merged
}

#[derive(Debug, Deserialize)]
struct ExpansionResponse {
    keywords: Vec<String>,
}

/// Result of keyword expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub keywords: Vec<String>,
    /// Set when expansion failed and the user keywords were used unmodified.
    pub warning: Option<String>,
}

/// Expands the query's keywords through the compute resource.
///
/// Never blocks retrieval: any failure other than cancellation falls back to
/// the user keywords plus a warning.
pub async fn expand_keywords(
    query: &ResearchQuery,
    gateway: &StageGateway,
    cap: usize,
    cancel: &CancellationToken,
) -> Result<Expansion, InvocationFailure> {
    let user = if query.keywords.is_empty() {
        "none provided".to_string()
    } else {
        query.keywords.join(", ")
    };
    let request = CompletionRequest::new(format!(
        "Research question: {}\nDomain: {}\nUser keywords: {}\n\n\
         Suggest search keywords for academic literature databases: core concepts, \
         synonyms, related methodologies and established terminology.\n\
         Answer with JSON only: {{\"keywords\": [\"...\"]}}",
        query.question, query.domain, user
    ))
    .with_system("You are a research librarian who builds precise literature search queries.");

    match gateway.complete_json::<ExpansionResponse>(request, cancel).await {
        Ok(response) => {
            let keywords = merge_keywords(&response.keywords, &query.keywords, cap);
            debug!(count = keywords.len(), "Expanded search keywords");
            Ok(Expansion {
                keywords,
                warning: None,
            })
        }
        Err(InvocationFailure::Cancelled) => Err(InvocationFailure::Cancelled),
        Err(failure) => {
            warn!(error = %failure, "Keyword expansion failed; using user keywords");
            Ok(Expansion {
                keywords: merge_keywords(&[], &query.keywords, cap),
                warning: Some(format!("keyword expansion failed, using user keywords: {failure}")),
            })
        }
    }
}
