//! Pipeline configuration and the compute resource catalog.
//!
//! [`ResearchConfig`] is loaded once by the composition root (TOML file, then
//! environment overrides), validated, and passed by value into constructors.
//! Every field has a default, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stage::names;
use crate::{ResearchError, ResourceId, StageName};

// ---------------------------------------------------------------------------
// Resource catalog
// ---------------------------------------------------------------------------

/// Role a resource plays for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRole {
    Primary,
    Alternate,
}

impl std::fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Alternate => f.write_str("alternate"),
        }
    }
}

/// One model entry as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Model identifier understood by the inference endpoint.
    pub model_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Memory footprint in GB; the capacity attribute of the resource.
    #[serde(default)]
    pub memory_gb: u32,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_context_length() -> u32 {
    32_000
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    4096
}

/// Primary and optional alternate resource for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAssignment {
    pub primary: String,
    #[serde(default)]
    pub alternate: Option<String>,
}

/// A resolved, immutable compute resource descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    pub model_id: String,
    pub display_name: String,
    pub memory_gb: u32,
    pub context_length: u32,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Resource descriptors plus per-stage primary/alternate assignments.
///
/// Read-only after construction and shared between stages without locking.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    resources: BTreeMap<ResourceId, ResourceDescriptor>,
    assignments: BTreeMap<StageName, StageAssignment>,
}

impl ResourceCatalog {
    /// Resolves the descriptor serving `stage` in `role`.
    pub fn resolve(&self, stage: &StageName, role: ResourceRole) -> Option<&ResourceDescriptor> {
        let assignment = self.assignments.get(stage)?;
        let key = match role {
            ResourceRole::Primary => assignment.primary.as_str(),
            ResourceRole::Alternate => assignment.alternate.as_deref()?,
        };
        let id = ResourceId::new(key)?;
        self.resources.get(&id)
    }

    pub fn descriptor(&self, id: &ResourceId) -> Option<&ResourceDescriptor> {
        self.resources.get(id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.values()
    }
}

// ---------------------------------------------------------------------------
// Settings sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub per_attempt_timeout_secs: u64,
    /// First backoff delay; doubles after every failed attempt.
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout_secs: 300,
            base_delay_millis: 1000,
            max_delay_millis: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_millis)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub results_per_source: usize,
    pub source_timeout_secs: u64,
    /// Number of top heuristic candidates re-scored by the LLM.
    pub rerank_top_k: usize,
    pub min_relevance: f64,
    /// Documents published within this many years get the full recency bonus.
    pub recency_window_years: i32,
    pub max_keywords: usize,
    /// Citation count that earns the full citation component.
    pub citation_normalizer: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            results_per_source: 50,
            source_timeout_secs: 30,
            rerank_top_k: 10,
            min_relevance: 0.2,
            recency_window_years: 5,
            max_keywords: 25,
            citation_normalizer: 100,
        }
    }
}

impl RetrievalSettings {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }
}

/// What the executor does when a stage fails or its precondition is unmet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure, leave the stage's output empty, run the next stage.
    #[default]
    Continue,
    /// Record the failure and abort the run.
    Halt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub stage_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub failure_policy: FailurePolicy,
    /// Revision passes allowed after a failed quality gate; 0 disables the loop.
    pub max_reworks: u32,
    pub min_quality_score: f64,
    /// Concurrent per-document calls inside a stage.
    pub document_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 600,
            run_timeout_secs: 1800,
            failure_policy: FailurePolicy::Continue,
            max_reworks: 2,
            min_quality_score: 0.8,
            document_concurrency: 4,
        }
    }
}

impl EngineSettings {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub arxiv_base_url: String,
    pub semantic_scholar_url: String,
    /// Adapters to register, in merge order.
    pub enabled: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            arxiv_base_url: "http://export.arxiv.org/api/query".into(),
            semantic_scholar_url: "https://api.semanticscholar.org/graph/v1".into(),
            enabled: vec!["arxiv".into(), "semantic_scholar".into()],
        }
    }
}

/// Defaults applied to queries built from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    pub max_sources: usize,
    pub min_sources: usize,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            max_sources: crate::query::DEFAULT_MAX_SOURCES,
            min_sources: crate::query::DEFAULT_MIN_SOURCES,
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub ollama_host: String,
    pub resources: BTreeMap<String, ResourceSpec>,
    pub stages: BTreeMap<String, StageAssignment>,
    pub retry: RetrySettings,
    pub retrieval: RetrievalSettings,
    pub engine: EngineSettings,
    pub sources: SourceSettings,
    pub query: QueryDefaults,
    /// Directory for durable checkpoints; in-memory only when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            ollama_host: "http://localhost:11434".into(),
            resources: default_resources(),
            stages: default_assignments(),
            retry: RetrySettings::default(),
            retrieval: RetrievalSettings::default(),
            engine: EngineSettings::default(),
            sources: SourceSettings::default(),
            query: QueryDefaults::default(),
            checkpoint_dir: None,
            output_dir: PathBuf::from("research_outputs"),
        }
    }
}

fn default_resources() -> BTreeMap<String, ResourceSpec> {
    let spec = |model_id: &str, name: &str, memory_gb, context_length| ResourceSpec {
        model_id: model_id.into(),
        display_name: Some(name.into()),
        memory_gb,
        context_length,
        temperature: default_temperature(),
        max_tokens: default_max_tokens(),
    };
    BTreeMap::from([
        ("qwen_coder_14b".into(), spec("qwen2.5-coder:14b", "Qwen2.5-Coder-14B", 9, 32_000)),
        ("deepseek_14b".into(), spec("deepseek-r1:14b", "DeepSeek-R1-14B", 9, 64_000)),
        ("phi4".into(), spec("phi4:latest", "Phi-4", 9, 16_000)),
        ("mistral_7b".into(), spec("mistral:7b", "Mistral-7B", 4, 32_000)),
        ("llama_8b".into(), spec("llama3.1:8b", "Llama-3.1-8B", 5, 128_000)),
    ])
}

fn default_assignments() -> BTreeMap<String, StageAssignment> {
    let assign = |primary: &str, alternate: &str| StageAssignment {
        primary: primary.into(),
        alternate: Some(alternate.into()),
    };
    BTreeMap::from([
        (names::LITERATURE_SEARCH.into(), assign("qwen_coder_14b", "llama_8b")),
        (names::DOCUMENT_ANALYSIS.into(), assign("deepseek_14b", "qwen_coder_14b")),
        (names::CONCEPT_VALIDATION.into(), assign("phi4", "mistral_7b")),
        (names::CONTENT_SYNTHESIS.into(), assign("deepseek_14b", "qwen_coder_14b")),
        (names::REPORT_GENERATION.into(), assign("qwen_coder_14b", "mistral_7b")),
        (names::QUALITY_CONTROL.into(), assign("deepseek_14b", "llama_8b")),
    ])
}

impl ResearchConfig {
    /// Parses a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Configuration`] if the document is not valid
    /// TOML or does not match the schema.
    pub fn from_toml_str(text: &str) -> Result<Self, ResearchError> {
        toml::from_str(text).map_err(|e| ResearchError::Configuration {
            message: e.to_string(),
        })
    }

    /// Applies `OLLAMA_HOST`, `MIN_QUALITY_SCORE` and `MAX_SOURCES` overrides.
    ///
    /// `lookup` abstracts the environment so callers (and tests) inject it.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Configuration`] if an override does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ResearchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OLLAMA_HOST").filter(|h| !h.trim().is_empty()) {
            self.ollama_host = host.trim().to_string();
            tracing::debug!(ollama_host = %self.ollama_host, "OLLAMA_HOST override applied");
        }
        if let Some(raw) = lookup("MIN_QUALITY_SCORE") {
            self.engine.min_quality_score = raw.trim().parse().map_err(|_| ResearchError::Configuration {
                message: format!("MIN_QUALITY_SCORE is not a number: '{raw}'"),
            })?;
            tracing::debug!(min_quality_score = self.engine.min_quality_score, "MIN_QUALITY_SCORE override applied");
        }
        if let Some(raw) = lookup("MAX_SOURCES") {
            self.query.max_sources = raw.trim().parse().map_err(|_| ResearchError::Configuration {
                message: format!("MAX_SOURCES is not a non-negative integer: '{raw}'"),
            })?;
            tracing::debug!(max_sources = self.query.max_sources, "MAX_SOURCES override applied");
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<(), ResearchError> {
        let fail = |message: String| Err(ResearchError::Configuration { message });

        if self.ollama_host.trim().is_empty() {
            return fail("ollama_host must not be empty".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if self.retry.per_attempt_timeout_secs == 0 {
            return fail("retry.per_attempt_timeout_secs must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_relevance) {
            return fail("retrieval.min_relevance must lie in [0, 1]".into());
        }
        if self.retrieval.citation_normalizer == 0 {
            return fail("retrieval.citation_normalizer must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.engine.min_quality_score) {
            return fail("engine.min_quality_score must lie in [0, 1]".into());
        }
        if self.engine.stage_timeout_secs == 0 || self.engine.run_timeout_secs == 0 {
            return fail("engine timeouts must be positive".into());
        }
        if self.engine.document_concurrency == 0 {
            return fail("engine.document_concurrency must be at least 1".into());
        }
        if self.query.max_sources == 0 {
            return fail("query.max_sources must be at least 1".into());
        }
        for (key, spec) in &self.resources {
            if key.trim().is_empty() || spec.model_id.trim().is_empty() {
                return fail(format!("resource '{key}' needs a non-empty id and model_id"));
            }
        }
        for stage in names::ALL {
            let Some(assignment) = self.stages.get(stage) else {
                return fail(format!("stage '{stage}' has no resource assignment"));
            };
            if !self.resources.contains_key(&assignment.primary) {
                return fail(format!(
                    "stage '{stage}' uses unknown primary resource '{}'",
                    assignment.primary
                ));
            }
            if let Some(alt) = &assignment.alternate {
                if !self.resources.contains_key(alt) {
                    return fail(format!("stage '{stage}' uses unknown alternate resource '{alt}'"));
                }
            }
        }
        Ok(())
    }

    /// Builds the immutable resource catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Configuration`] for blank resource or stage keys.
    pub fn catalog(&self) -> Result<ResourceCatalog, ResearchError> {
        let blank = |what: &str| ResearchError::Configuration {
            message: format!("blank {what} key in configuration"),
        };

        let mut resources = BTreeMap::new();
        for (key, spec) in &self.resources {
            let id = ResourceId::new(key.as_str()).ok_or_else(|| blank("resource"))?;
            resources.insert(
                id.clone(),
                ResourceDescriptor {
                    display_name: spec.display_name.clone().unwrap_or_else(|| key.clone()),
                    id,
                    model_id: spec.model_id.clone(),
                    memory_gb: spec.memory_gb,
                    context_length: spec.context_length,
                    temperature: spec.temperature,
                    max_tokens: spec.max_tokens,
                },
            );
        }
        let mut assignments = BTreeMap::new();
        for (stage, assignment) in &self.stages {
            let name = StageName::new(stage.as_str()).ok_or_else(|| blank("stage"))?;
            assignments.insert(name, assignment.clone());
        }
        Ok(ResourceCatalog {
            resources,
            assignments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_valid_defaults() {
        let config = ResearchConfig::from_toml_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.resources.len(), 5);
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config = ResearchConfig::from_toml_str(
            r#"
            [engine]
            failure_policy = "halt"
            max_reworks = 0

            [retrieval]
            rerank_top_k = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.failure_policy, FailurePolicy::Halt);
        assert_eq!(config.engine.max_reworks, 0);
        assert_eq!(config.engine.run_timeout_secs, 1800);
        assert_eq!(config.retrieval.rerank_top_k, 3);
        assert_eq!(config.retrieval.min_relevance, 0.2);
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = ResearchConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "OLLAMA_HOST" => Some("http://gpu-box:11434".into()),
                "MAX_SOURCES" => Some("12".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.ollama_host, "http://gpu-box:11434");
        assert_eq!(config.query.max_sources, 12);
    }

    #[test]
    fn test_small_max_sources_override_keeps_config_valid() {
        let mut config = ResearchConfig::default();
        config
            .apply_env_overrides(|key| (key == "MAX_SOURCES").then(|| "3".to_string()))
            .unwrap();
        assert_eq!(config.query.max_sources, 3);
        assert!(config.query.min_sources > 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_unparseable_env_override_is_a_configuration_error() {
        let mut config = ResearchConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "MIN_QUALITY_SCORE").then(|| "high".to_string()))
            .unwrap_err();
        assert!(matches!(err, ResearchError::Configuration { .. }));
    }

    #[test]
    fn test_unknown_assignment_fails_validation() {
        let mut config = ResearchConfig::default();
        config
            .stages
            .insert(names::QUALITY_CONTROL.into(), StageAssignment {
                primary: "gpt_9".into(),
                alternate: None,
            });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gpt_9"));
    }

    #[test]
    fn test_catalog_resolves_primary_and_alternate() {
        let catalog = ResearchConfig::default().catalog().unwrap();
        let stage = StageName::from_static(names::CONCEPT_VALIDATION);
        let primary = catalog.resolve(&stage, ResourceRole::Primary).unwrap();
        let alternate = catalog.resolve(&stage, ResourceRole::Alternate).unwrap();
        assert_eq!(primary.model_id, "phi4:latest");
        assert_eq!(alternate.model_id, "mistral:7b");
        assert!(catalog
            .resolve(&StageName::from_static("unknown"), ResourceRole::Primary)
            .is_none());
    }
}
