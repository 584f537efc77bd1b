//! Literature source port.

use async_trait::async_trait;

use crate::{Paper, SourceError, SourceName};

/// Search terms handed to every source adapter.
///
/// Each adapter builds its own query syntax from these parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchRequest {
    /// Significant words taken from the research question.
    pub question_terms: Vec<String>,
    /// User plus expanded keywords, deduplicated.
    pub keywords: Vec<String>,
    /// Domain-specific phrases (see [`crate::ResearchDomain::search_terms`]).
    pub domain_terms: Vec<String>,
    /// Upper bound on the number of records to return.
    pub limit: usize,
}

/// An integration with one external literature database.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &SourceName;

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError>;
}
