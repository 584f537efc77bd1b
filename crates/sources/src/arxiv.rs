//! arXiv adapter over the export API's Atom feed.

use async_trait::async_trait;
use chrono::NaiveDate;
use pipeline::{Paper, SearchRequest, SourceAdapter, SourceError, SourceName};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::Client;
use tracing::{debug, instrument};

pub const NAME: &str = "arxiv";

const MAX_QUESTION_TERMS: usize = 5;
const MAX_KEYWORDS: usize = 10;
const MAX_TERMS: usize = 15;

pub struct ArxivSource {
    name: SourceName,
    client: Client,
    base_url: String,
}

impl ArxivSource {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            name: SourceName::from_static(NAME),
            client,
            base_url: base_url.to_string(),
        }
    }

    fn request_error(&self, e: reqwest::Error) -> SourceError {
        SourceError::Request {
            source_name: self.name.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for ArxivSource {
    fn name(&self) -> &SourceName {
        &self.name
    }

    #[instrument(skip(self, request), fields(source = NAME, limit = request.limit))]
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let query = build_query(request);
        debug!(query = %query, "arXiv query");
        let limit = request.limit.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", query.as_str()),
                ("start", "0"),
                ("max_results", limit.as_str()),
                ("sortBy", "relevance"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: self.name.clone(),
                status: response.status().as_u16(),
            });
        }
        let body = response.text().await.map_err(|e| self.request_error(e))?;
        parse_feed(&body, &self.name)
    }
}

/// OR-joined quoted terms: question words first, then keywords.
pub fn build_query(request: &SearchRequest) -> String {
    request
        .question_terms
        .iter()
        .take(MAX_QUESTION_TERMS)
        .chain(request.keywords.iter().take(MAX_KEYWORDS))
        .take(MAX_TERMS)
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Id,
    Title,
    Summary,
    Published,
    AuthorName,
    Doi,
    JournalRef,
}

impl Field {
    fn from_tag(tag: &[u8], in_author: bool) -> Option<Self> {
        match tag {
            b"id" => Some(Self::Id),
            b"title" => Some(Self::Title),
            b"summary" => Some(Self::Summary),
            b"published" => Some(Self::Published),
            b"name" if in_author => Some(Self::AuthorName),
            b"arxiv:doi" => Some(Self::Doi),
            b"arxiv:journal_ref" => Some(Self::JournalRef),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    doi: String,
    journal_ref: String,
    landing_page: Option<String>,
    pdf: Option<String>,
}

impl Entry {
    fn push(&mut self, field: Field, text: &str) {
        match field {
            Field::Id => self.id.push_str(text),
            Field::Title => self.title.push_str(text),
            Field::Summary => self.summary.push_str(text),
            Field::Published => self.published.push_str(text),
            Field::AuthorName => match self.authors.last_mut() {
                Some(last) => last.push_str(text),
                None => self.authors.push(text.to_string()),
            },
            Field::Doi => self.doi.push_str(text),
            Field::JournalRef => self.journal_ref.push_str(text),
        }
    }

    fn link(&mut self, element: &BytesStart<'_>) {
        let mut href = None;
        let mut rel = None;
        let mut title = None;
        for attr in element.attributes().flatten() {
            let Ok(value) = attr.unescape_value() else {
                continue;
            };
            match attr.key.as_ref() {
                b"href" => href = Some(value.into_owned()),
                b"rel" => rel = Some(value.into_owned()),
                b"title" => title = Some(value.into_owned()),
                _ => {}
            }
        }
        let Some(href) = href else {
            return;
        };
        if title.as_deref() == Some("pdf") {
            self.pdf = Some(href);
        } else if rel.as_deref() == Some("alternate") {
            self.landing_page = Some(href);
        }
    }

    /// `None` for arXiv's error pseudo-entries.
    fn finish(self, source: &SourceName) -> Result<Option<Paper>, String> {
        let id = self.id.trim();
        if id.contains("/api/errors") {
            return Err(collapse_whitespace(&self.summary));
        }
        let title = collapse_whitespace(&self.title);
        if title.is_empty() {
            return Ok(None);
        }
        let mut paper = Paper::new(title, source.clone());
        paper.authors = self
            .authors
            .iter()
            .map(|a| collapse_whitespace(a))
            .filter(|a| !a.is_empty())
            .collect();
        paper.summary = collapse_whitespace(&self.summary);
        paper.url = self.landing_page.unwrap_or_else(|| id.to_string());
        paper.pdf_url = self.pdf;
        paper.arxiv_id = short_id(id);
        paper.doi = non_empty(&self.doi);
        paper.venue = non_empty(&self.journal_ref);
        paper.published = self
            .published
            .trim()
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        Ok(Some(paper))
    }
}

/// Parses an arXiv Atom feed into papers.
///
/// # Errors
///
/// Returns [`SourceError::Parse`] for malformed XML or when the feed carries
/// an arXiv error entry.
pub fn parse_feed(xml: &str, source: &SourceName) -> Result<Vec<Paper>, SourceError> {
    let parse_error = |message: String| SourceError::Parse {
        source_name: source.clone(),
        message,
    };

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut papers = Vec::new();
    let mut entry: Option<Entry> = None;
    let mut field: Option<Field> = None;
    let mut in_author = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"entry" => entry = Some(Entry::default()),
                b"author" => {
                    in_author = true;
                    if let Some(current) = entry.as_mut() {
                        current.authors.push(String::new());
                    }
                }
                b"link" => {
                    if let Some(current) = entry.as_mut() {
                        current.link(&e);
                    }
                }
                tag => field = entry.as_ref().and_then(|_| Field::from_tag(tag, in_author)),
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"link" => {
                if let Some(current) = entry.as_mut() {
                    current.link(&e);
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(current), Some(f)) = (entry.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| parse_error(format!("bad text at {}: {e}", reader.buffer_position())))?;
                    current.push(f, &text);
                }
            }
            Ok(Event::CData(t)) => {
                if let (Some(current), Some(f)) = (entry.as_mut(), field) {
                    current.push(f, &String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"entry" => {
                    if let Some(done) = entry.take() {
                        match done.finish(source) {
                            Ok(Some(paper)) => papers.push(paper),
                            Ok(None) => {}
                            Err(message) => return Err(parse_error(format!("arXiv error: {message}"))),
                        }
                    }
                    field = None;
                }
                b"author" => {
                    in_author = false;
                    field = None;
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(parse_error(format!(
                    "invalid XML at {}: {e}",
                    reader.error_position()
                )))
            }
            _ => {}
        }
    }
    Ok(papers)
}

/// `2101.00001v2` from `http://arxiv.org/abs/2101.00001v2`.
fn short_id(id: &str) -> Option<String> {
    id.split_once("/abs/")
        .map(|(_, rest)| rest.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
