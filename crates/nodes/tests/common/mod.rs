//! Fakes shared by the end-to-end pipeline tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nodes::{build_pipeline, InMemoryCheckpointStore, PipelineExecutor};
use pipeline::{
    Completion, CompletionRequest, LlmError, LlmProvider, Paper, ResearchConfig, ResourceConnector,
    ResourceDescriptor, SearchRequest, SourceAdapter, SourceError, SourceName,
};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub struct StaticSource {
    name: SourceName,
    result: Result<Vec<Paper>, String>,
}

impl StaticSource {
    pub fn returning(name: &str, papers: Vec<Paper>) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            name: SourceName::new(name).unwrap(),
            result: Ok(papers),
        })
    }

    pub fn failing(name: &str) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            name: SourceName::new(name).unwrap(),
            result: Err("connection refused".into()),
        })
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn name(&self) -> &SourceName {
        &self.name
    }

    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        self.result.clone().map_err(|message| SourceError::Request {
            source_name: self.name.clone(),
            message,
        })
    }
}

pub fn paper(source: &str, title: &str, citations: u64) -> Paper {
    let mut p = Paper::new(title, SourceName::new(source).unwrap());
    p.citations = citations;
    p.summary = format!("{title}. A study of optics teaching.");
    p.authors = vec!["Ada Lovelace".into()];
    p.url = format!("https://example.org/{}", title.replace(' ', "-"));
    p
}

// ---------------------------------------------------------------------------
// Compute resources
// ---------------------------------------------------------------------------

/// Answers each stage's prompt with a canned JSON document.
pub struct CannedProvider {
    model: String,
    aspect_score: f64,
    prompts: Mutex<Vec<String>>,
}

impl CannedProvider {
    pub fn new(model: &str, aspect_score: f64) -> Arc<Self> {
        Arc::new(Self {
            model: model.into(),
            aspect_score,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn answer(&self, prompt: &str) -> String {
        if prompt.contains("{\"keywords\"") {
            r#"{"keywords": ["refraction", "lenses"]}"#.into()
        } else if prompt.contains("{\"scores\"") {
            r#"{"scores": []}"#.into()
        } else if prompt.contains("\"key_findings\"") {
            r#"{"key_findings": ["Labs help"], "methodology": "survey", "results_summary": "positive",
                "limitations": [], "concepts": ["optics", "refraction"], "approaches": ["labs"],
                "confidence": 0.8}"#
                .into()
        } else if prompt.contains("{\"validations\"") {
            r#"{"validations": [{"concept": "optics", "is_valid": true, "confidence": 0.9,
                "explanation": "correct"}]}"#
                .into()
        } else if prompt.contains("\"insights\"") {
            r#"{"summary": "Hands-on labs consistently help.", "insights": [{"kind": "pattern",
                "title": "Labs help", "description": "Most studies agree.", "confidence": 0.8}]}"#
                .into()
        } else if prompt.contains("\"executive_summary\"") {
            r#"{"executive_summary": "Labs improve optics learning.", "recommendations": ["Use labs"],
                "conclusion": "Labs work."}"#
                .into()
        } else if prompt.contains("\"literature\": 0") {
            let s = self.aspect_score;
            format!(
                r#"{{"literature": {s}, "analysis": {s}, "validation": {s}, "synthesis": {s},
                    "report": {s}, "feedback": "Broaden the evidence base."}}"#
            )
        } else {
            "{}".into()
        }
    }
}

#[async_trait]
impl LlmProvider for CannedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(Completion {
            text: self.answer(&request.prompt),
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Serves one provider for every resource except the `missing` ones, which
/// fail initialisation.
pub struct CannedConnector {
    provider: Arc<CannedProvider>,
    missing: HashSet<String>,
}

impl CannedConnector {
    pub fn new(provider: Arc<CannedProvider>) -> Self {
        Self {
            provider,
            missing: HashSet::new(),
        }
    }

    pub fn without(mut self, resource: &str) -> Self {
        self.missing.insert(resource.into());
        self
    }
}

#[async_trait]
impl ResourceConnector for CannedConnector {
    async fn connect(&self, descriptor: &ResourceDescriptor) -> Result<Arc<dyn LlmProvider>, LlmError> {
        if self.missing.contains(descriptor.id.as_str()) {
            return Err(LlmError::ResourceUnavailable {
                resource: descriptor.id.clone(),
                message: format!("model '{}' is not installed", descriptor.model_id),
            });
        }
        Ok(self.provider.clone() as Arc<dyn LlmProvider>)
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

pub fn config(max_reworks: u32) -> ResearchConfig {
    let mut config = ResearchConfig::default();
    config.engine.max_reworks = max_reworks;
    config.retry.max_attempts = 1;
    config.retry.base_delay_millis = 1;
    config.retry.max_delay_millis = 1;
    config
}

pub fn executor(
    config: &ResearchConfig,
    connector: CannedConnector,
    adapters: Vec<Arc<dyn SourceAdapter>>,
) -> PipelineExecutor {
    build_pipeline(
        config,
        Arc::new(connector),
        adapters,
        Arc::new(InMemoryCheckpointStore::new()),
    )
    .unwrap()
}
