//! Literature source adapters.
//!
//! Implements [`pipeline::SourceAdapter`] for arXiv (Atom feed) and Semantic
//! Scholar (Graph API JSON). Each adapter turns a [`pipeline::SearchRequest`]
//! into its own query syntax and maps records onto [`pipeline::Paper`]
//! tagged with the adapter's [`pipeline::SourceName`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Adapters make one HTTP request per search and report
//! every failure as a [`pipeline::SourceError`]. Timeouts, fan-out and merge
//! order are the retrieval stage's concern.

pub mod arxiv;
pub mod semantic_scholar;

use std::sync::Arc;

use pipeline::{ResearchError, SourceAdapter, SourceSettings};

pub use arxiv::ArxivSource;
pub use semantic_scholar::SemanticScholarSource;

/// Builds the enabled adapters, in the configured (merge) order.
///
/// # Errors
///
/// Returns [`ResearchError::Configuration`] for an unknown adapter name.
pub fn from_settings(settings: &SourceSettings) -> Result<Vec<Arc<dyn SourceAdapter>>, ResearchError> {
    let client = reqwest::Client::new();
    settings
        .enabled
        .iter()
        .map(|name| -> Result<Arc<dyn SourceAdapter>, ResearchError> {
            match name.as_str() {
                arxiv::NAME => Ok(Arc::new(ArxivSource::new(client.clone(), &settings.arxiv_base_url))),
                semantic_scholar::NAME => Ok(Arc::new(SemanticScholarSource::new(
                    client.clone(),
                    &settings.semantic_scholar_url,
                ))),
                other => Err(ResearchError::Configuration {
                    message: format!("unknown literature source '{other}'"),
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapters_follow_configured_order() {
        let settings = SourceSettings {
            enabled: vec!["semantic_scholar".into(), "arxiv".into()],
            ..SourceSettings::default()
        };
        let adapters = from_settings(&settings).unwrap();
        let names: Vec<_> = adapters.iter().map(|a| a.name().as_str().to_string()).collect();
        assert_eq!(names, vec!["semantic_scholar", "arxiv"]);
    }

    #[test]
    fn test_unknown_adapter_is_a_configuration_error() {
        let settings = SourceSettings {
            enabled: vec!["pubmed".into()],
            ..SourceSettings::default()
        };
        assert!(matches!(
            from_settings(&settings),
            Err(ResearchError::Configuration { .. })
        ));
    }
}
