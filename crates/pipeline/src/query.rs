//! The research query: the immutable input of every run.

use serde::{Deserialize, Serialize};

use crate::{ResearchError, SessionId, Timestamp};

/// Default upper bound on the number of documents a run keeps.
pub const DEFAULT_MAX_SOURCES: usize = 20;

/// Default lower bound the retrieval filter tries to reach.
pub const DEFAULT_MIN_SOURCES: usize = 5;

/// Research domain tag.
///
/// Selects domain-specific search terms and is passed to every LLM request
/// as context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDomain {
    /// Physics education research (the default domain).
    #[default]
    PhysicsEducation,
    /// General physics.
    GeneralPhysics,
    /// Educational technology.
    EducationTechnology,
    /// Pedagogy and teaching practice.
    Pedagogy,
}

impl ResearchDomain {
    /// Stable snake_case name, matching the serialised form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhysicsEducation => "physics_education",
            Self::GeneralPhysics => "general_physics",
            Self::EducationTechnology => "education_technology",
            Self::Pedagogy => "pedagogy",
        }
    }

    /// Additional search terms literature sources should include for this domain.
    pub fn search_terms(self) -> &'static [&'static str] {
        match self {
            Self::PhysicsEducation => &["physics education", "teaching physics", "learning physics"],
            Self::GeneralPhysics | Self::EducationTechnology | Self::Pedagogy => &[],
        }
    }
}

impl std::fmt::Display for ResearchDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResearchDomain {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "physics_education" => Ok(Self::PhysicsEducation),
            "general_physics" => Ok(Self::GeneralPhysics),
            "education_technology" => Ok(Self::EducationTechnology),
            "pedagogy" => Ok(Self::Pedagogy),
            other => Err(ResearchError::InvalidQuery {
                reason: format!("unknown research domain '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// Inclusive range of preferred publication years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    /// First preferred year (inclusive).
    pub start: i32,
    /// Last preferred year (inclusive).
    pub end: i32,
}

impl YearRange {
    /// Creates a range, returning `None` if `start > end`.
    pub fn new(start: i32, end: i32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Returns `true` if `year` lies within the range.
    pub fn contains(self, year: i32) -> bool {
        (self.start..=self.end).contains(&year)
    }
}

// ---------------------------------------------------------------------------

/// A research question plus the bounds and filters that shape retrieval.
///
/// Created once at run start and never mutated afterwards. Construct through
/// [`ResearchQuery::builder`], which validates the invariants; a deserialised
/// query is re-validated by the executor before any stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchQuery {
    /// The research question text.
    pub question: String,
    /// Domain tag.
    pub domain: ResearchDomain,
    /// Maximum number of documents retrieval may return.
    pub max_sources: usize,
    /// Minimum number of documents retrieval tries to return.
    pub min_sources: usize,
    /// Keywords that steer the search.
    pub keywords: Vec<String>,
    /// Keywords whose presence in title or abstract excludes a document.
    pub exclude_keywords: Vec<String>,
    /// Preferred publication year range, if any.
    pub preferred_years: Option<YearRange>,
    /// Unique session identifier.
    pub session_id: SessionId,
    /// When the query was created.
    pub created_at: Timestamp,
}

impl ResearchQuery {
    /// Starts building a query for `question` with default bounds.
    pub fn builder(question: impl Into<String>) -> ResearchQueryBuilder {
        ResearchQueryBuilder {
            question: question.into(),
            domain: ResearchDomain::default(),
            max_sources: DEFAULT_MAX_SOURCES,
            min_sources: DEFAULT_MIN_SOURCES,
            keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            preferred_years: None,
            session_id: None,
        }
    }

    /// Checks the query invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::InvalidQuery`] when the question is blank,
    /// `max_sources` is zero, or the preferred year range is inverted.
    /// `min_sources` is a best-effort target and may exceed `max_sources`;
    /// retrieval never returns more than `max_sources`.
    pub fn validate(&self) -> Result<(), ResearchError> {
        let invalid = |reason: String| Err(ResearchError::InvalidQuery { reason });

        if self.question.trim().is_empty() {
            return invalid("question must not be empty".into());
        }
        if self.max_sources == 0 {
            return invalid("max_sources must be at least 1".into());
        }
        if let Some(range) = self.preferred_years {
            if range.start > range.end {
                return invalid(format!(
                    "preferred year range {}..={} is inverted",
                    range.start, range.end
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`ResearchQuery`].
#[derive(Debug, Clone)]
pub struct ResearchQueryBuilder {
    question: String,
    domain: ResearchDomain,
    max_sources: usize,
    min_sources: usize,
    keywords: Vec<String>,
    exclude_keywords: Vec<String>,
    preferred_years: Option<YearRange>,
    session_id: Option<SessionId>,
}

impl ResearchQueryBuilder {
    pub fn domain(mut self, domain: ResearchDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn max_sources(mut self, max: usize) -> Self {
        self.max_sources = max;
        self
    }

    pub fn min_sources(mut self, min: usize) -> Self {
        self.min_sources = min;
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = clean_terms(keywords);
        self
    }

    pub fn exclude_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keywords = clean_terms(keywords);
        self
    }

    pub fn preferred_years(mut self, range: YearRange) -> Self {
        self.preferred_years = Some(range);
        self
    }

    /// Uses an explicit session identifier instead of generating one.
    pub fn session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    /// Validates and builds the query. `min_sources` is clamped to
    /// `max_sources`.
    ///
    /// # Errors
    ///
    /// See [`ResearchQuery::validate`].
    pub fn build(self) -> Result<ResearchQuery, ResearchError> {
        let query = ResearchQuery {
            question: self.question.trim().to_string(),
            domain: self.domain,
            max_sources: self.max_sources,
            min_sources: self.min_sources.min(self.max_sources),
            keywords: self.keywords,
            exclude_keywords: self.exclude_keywords,
            preferred_years: self.preferred_years,
            session_id: self.session_id.unwrap_or_else(SessionId::generate),
            created_at: Timestamp::now(),
        };
        query.validate()?;
        Ok(query)
    }
}

fn clean_terms<I, S>(terms: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    terms
        .into_iter()
        .map(|t| t.into().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_applies_defaults() {
        let query = ResearchQuery::builder("How do students learn circuits?")
            .build()
            .unwrap();
        assert_eq!(query.max_sources, DEFAULT_MAX_SOURCES);
        assert_eq!(query.min_sources, DEFAULT_MIN_SOURCES);
        assert_eq!(query.domain, ResearchDomain::PhysicsEducation);
    }

    #[test]
    fn test_blank_question_is_rejected() {
        let err = ResearchQuery::builder("   ").build().unwrap_err();
        assert!(matches!(err, ResearchError::InvalidQuery { .. }));
    }

    #[test]
    fn test_min_sources_is_clamped_to_max() {
        let query = ResearchQuery::builder("How do labs help?")
            .max_sources(3)
            .build()
            .unwrap();
        assert_eq!(query.max_sources, 3);
        assert_eq!(query.min_sources, 3);

        let query = ResearchQuery::builder("q").max_sources(3).min_sources(4).build().unwrap();
        assert_eq!(query.min_sources, 3);
    }

    #[test]
    fn test_zero_max_sources_is_rejected() {
        let err = ResearchQuery::builder("q").max_sources(0).build().unwrap_err();
        assert!(err.to_string().contains("max_sources"));
    }

    #[test]
    fn test_keywords_are_trimmed_and_blank_entries_dropped() {
        let query = ResearchQuery::builder("q")
            .keywords([" optics ", "", "lenses"])
            .build()
            .unwrap();
        assert_eq!(query.keywords, vec!["optics", "lenses"]);
    }

    #[test]
    fn test_domain_parses_kebab_and_snake_case() {
        assert_eq!(
            "education-technology".parse::<ResearchDomain>().unwrap(),
            ResearchDomain::EducationTechnology
        );
        assert!("astrology".parse::<ResearchDomain>().is_err());
    }

    #[test]
    fn test_year_range_rejects_inverted_bounds() {
        assert!(YearRange::new(2024, 2020).is_none());
        let range = YearRange::new(2018, 2022).unwrap();
        assert!(range.contains(2018));
        assert!(!range.contains(2023));
    }
}
