//! Semantic Scholar adapter over the Graph API paper search.

use async_trait::async_trait;
use chrono::NaiveDate;
use pipeline::{Paper, SearchRequest, SourceAdapter, SourceError, SourceName};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

pub const NAME: &str = "semantic_scholar";

/// Fields requested for every search hit.
pub const FIELDS: &str = "paperId,title,abstract,authors,venue,year,citationCount,url,openAccessPdf,externalIds";

const MAX_QUESTION_TERMS: usize = 3;
const MAX_KEYWORDS: usize = 5;
const MAX_TERMS: usize = 10;

pub struct SemanticScholarSource {
    name: SourceName,
    client: Client,
    base_url: String,
}

impl SemanticScholarSource {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            name: SourceName::from_static(NAME),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for SemanticScholarSource {
    fn name(&self) -> &SourceName {
        &self.name
    }

    #[instrument(skip(self, request), fields(source = NAME, limit = request.limit))]
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let query = build_query(request);
        debug!(query = %query, "Semantic Scholar query");
        let limit = request.limit.to_string();
        let response = self
            .client
            .get(format!("{}/paper/search", self.base_url))
            .query(&[("query", query.as_str()), ("limit", limit.as_str()), ("fields", FIELDS)])
            .send()
            .await
            .map_err(|e| SourceError::Request {
                source_name: self.name.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: self.name.clone(),
                status: response.status().as_u16(),
            });
        }
        let body = response.text().await.map_err(|e| SourceError::Request {
            source_name: self.name.clone(),
            message: e.to_string(),
        })?;
        parse_response(&body, &self.name)
    }
}

/// Space-joined terms: question words, domain terms, then keywords.
pub fn build_query(request: &SearchRequest) -> String {
    request
        .question_terms
        .iter()
        .take(MAX_QUESTION_TERMS)
        .chain(request.domain_terms.iter())
        .chain(request.keywords.iter().take(MAX_KEYWORDS))
        .take(MAX_TERMS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hit {
    paper_id: String,
    title: Option<String>,
    #[serde(rename = "abstract")]
    summary: Option<String>,
    #[serde(default)]
    authors: Vec<Author>,
    venue: Option<String>,
    year: Option<i32>,
    citation_count: Option<u64>,
    url: Option<String>,
    open_access_pdf: Option<OpenAccessPdf>,
    external_ids: Option<ExternalIds>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAccessPdf {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
}

impl Hit {
    fn into_paper(self, source: &SourceName) -> Paper {
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());
        let mut paper = Paper::new(title, source.clone());
        paper.authors = self
            .authors
            .into_iter()
            .map(|a| a.name.unwrap_or_else(|| "Unknown".to_string()))
            .collect();
        paper.summary = self.summary.unwrap_or_default();
        paper.url = self
            .url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("https://semanticscholar.org/paper/{}", self.paper_id));
        paper.pdf_url = self.open_access_pdf.and_then(|p| p.url).filter(|u| !u.is_empty());
        paper.venue = self.venue.filter(|v| !v.trim().is_empty());
        paper.published = self.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1));
        paper.citations = self.citation_count.unwrap_or(0);
        if let Some(ids) = self.external_ids {
            paper.doi = ids.doi;
            paper.arxiv_id = ids.arxiv;
        }
        paper
    }
}

/// Parses a `/paper/search` response body.
///
/// # Errors
///
/// Returns [`SourceError::Parse`] when the body is not the expected JSON.
pub fn parse_response(body: &str, source: &SourceName) -> Result<Vec<Paper>, SourceError> {
    let response: SearchResponse = serde_json::from_str(body).map_err(|e| SourceError::Parse {
        source_name: source.clone(),
        message: e.to_string(),
    })?;
    Ok(response.data.into_iter().map(|hit| hit.into_paper(source)).collect())
}
