//! Ollama connector and provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    Completion, CompletionRequest, LlmError, LlmProvider, ResourceConnector, ResourceDescriptor,
    ResourceId,
};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument, warn};

use crate::wire::{GenerateOptions, GenerateRequest, GenerateResponse, TagsResponse};

/// Longest response body excerpt carried in an error.
const BODY_EXCERPT: usize = 200;

/// Initialises [`OllamaProvider`]s against one Ollama endpoint.
pub struct OllamaConnector {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl OllamaConnector {
    /// Creates a connector for `base_url` (e.g. `http://localhost:11434`).
    ///
    /// `request_timeout` bounds every HTTP request made by the connector and
    /// by the providers it creates.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    async fn installed_models(&self, resource: &ResourceId) -> Result<TagsResponse, LlmError> {
        let unavailable = |message: String| LlmError::ResourceUnavailable {
            resource: resource.clone(),
            message,
        };
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| unavailable(format!("endpoint {} unreachable: {e}", self.base_url)))?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "model listing returned HTTP {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<TagsResponse>()
            .await
            .map_err(|e| unavailable(format!("model listing unreadable: {e}")))
    }
}

#[async_trait]
impl ResourceConnector for OllamaConnector {
    #[instrument(skip(self, descriptor), fields(resource = %descriptor.id, model = %descriptor.model_id))]
    async fn connect(&self, descriptor: &ResourceDescriptor) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let tags = self.installed_models(&descriptor.id).await?;
        let installed = tags.models.iter().any(|tag| {
            model_matches(&tag.name, &descriptor.model_id)
                || tag
                    .model
                    .as_deref()
                    .is_some_and(|m| model_matches(m, &descriptor.model_id))
        });
        if !installed {
            warn!(available = tags.models.len(), "Model is not installed on the endpoint");
            return Err(LlmError::ResourceUnavailable {
                resource: descriptor.id.clone(),
                message: format!("model '{}' is not installed", descriptor.model_id),
            });
        }
        debug!("Model available");
        Ok(Arc::new(OllamaProvider {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model: descriptor.model_id.clone(),
            request_timeout: self.request_timeout,
        }))
    }
}

/// `true` when an installed tag names the requested model. A request
/// without a tag matches the implicit `:latest`.
fn model_matches(installed: &str, requested: &str) -> bool {
    let with_tag = |name: &str| {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{name}:latest")
        }
    };
    with_tag(installed) == with_tag(requested)
}

/// One model on an Ollama endpoint, served through `/api/generate`.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    request_timeout: Duration,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    #[instrument(skip(self, request), fields(model = %self.model, json = request.json_output))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let body = generate_request(&self.model, &request);
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.request_timeout))?;

        let response = check_status(response).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse {
                message: format!("generate response: {e}"),
            })?;
        debug!(chars = parsed.response.len(), "Completion received");
        Ok(Completion {
            text: parsed.response,
            model: if parsed.model.is_empty() {
                self.model.clone()
            } else {
                parsed.model
            },
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn generate_request<'a>(model: &'a str, request: &'a CompletionRequest) -> GenerateRequest<'a> {
    GenerateRequest {
        model,
        prompt: &request.prompt,
        system: request.system.as_deref(),
        stream: false,
        format: request.json_output.then_some("json"),
        options: GenerateOptions {
            temperature: request.temperature,
            num_predict: request.max_tokens,
        },
    }
}

async fn check_status(response: Response) -> Result<Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    Err(map_http_error(status, retry_after, &body))
}

/// Maps a non-success status onto [`LlmError`].
fn map_http_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after },
        _ => LlmError::Http {
            status: status.as_u16(),
            message: body.chars().take(BODY_EXCERPT).collect(),
        },
    }
}

/// Maps a transport failure onto [`LlmError`].
fn map_transport_error(error: &reqwest::Error, timeout: Duration) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout { timeout }
    } else if let Some(status) = error.status() {
        map_http_error(status, None, &error.to_string())
    } else {
        LlmError::Connection {
            message: error.to_string(),
        }
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_model_matching_treats_missing_tag_as_latest() {
        assert!(model_matches("phi4:latest", "phi4"));
        assert!(model_matches("phi4", "phi4:latest"));
        assert!(model_matches("deepseek-r1:14b", "deepseek-r1:14b"));
        assert!(!model_matches("deepseek-r1:7b", "deepseek-r1:14b"));
        assert!(!model_matches("mistral:latest", "mistral:7b"));
    }

    #[test]
    fn test_generate_request_body() {
        let request = CompletionRequest::new("Summarise this.")
            .with_system("You are terse.")
            .with_temperature(0.2)
            .json();
        let body = serde_json::to_value(generate_request("phi4:latest", &request)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "phi4:latest",
                "prompt": "Summarise this.",
                "system": "You are terse.",
                "stream": false,
                "format": "json",
                "options": {"temperature": 0.2}
            })
        );
    }

    #[test]
    fn test_plain_request_omits_optional_fields() {
        let request = CompletionRequest::new("Hi");
        let body = serde_json::to_value(generate_request("m", &request)).unwrap();
        assert!(body.get("system").is_none());
        assert!(body.get("format").is_none());
        assert_eq!(body["options"], serde_json::json!({}));
    }

    #[test]
    fn test_status_mapping() {
        let limited = map_http_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "");
        assert_eq!(
            limited,
            LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );

        match map_http_error(StatusCode::SERVICE_UNAVAILABLE, None, "model loading") {
            LlmError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "model loading");
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_accepts_only_seconds() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_generate_and_tags_payloads_parse() {
        let generated: GenerateResponse =
            serde_json::from_str(r#"{"model": "phi4:latest", "response": "{\"a\":1}", "done": true}"#).unwrap();
        assert_eq!(generated.response, "{\"a\":1}");

        let tags: TagsResponse =
            serde_json::from_str(r#"{"models": [{"name": "phi4:latest", "model": "phi4:latest", "size": 1}]}"#)
                .unwrap();
        assert_eq!(tags.models[0].name, "phi4:latest");
    }
}
