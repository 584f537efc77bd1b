//! Compute resource ports.
//!
//! The resilience layer in `nodes` depends only on these traits; the Ollama
//! adapter in `llm` implements them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{LlmError, ResourceDescriptor};

/// A structured prompt plus generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Overrides the resource's default temperature when set.
    pub temperature: Option<f64>,
    /// Overrides the resource's default token limit when set.
    pub max_tokens: Option<u32>,
    /// Ask the endpoint to constrain output to JSON.
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            json_output: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Model that actually produced the text.
    pub model: String,
}

/// An initialised compute resource.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;

    fn model_name(&self) -> &str;
}

/// Initialises compute resources from their descriptors.
///
/// A failed `connect` is an initialisation failure: the resilience layer
/// switches the calling stage to its alternate resource.
#[async_trait]
pub trait ResourceConnector: Send + Sync {
    async fn connect(&self, descriptor: &ResourceDescriptor) -> Result<Arc<dyn LlmProvider>, LlmError>;
}
