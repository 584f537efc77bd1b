//! Ollama compute-resource adapter.
//!
//! Implements [`pipeline::ResourceConnector`] and [`pipeline::LlmProvider`]
//! for a local Ollama endpoint. Other endpoints are added as new modules in
//! this crate without any changes to the `pipeline` crate.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response parsing
//! and the mapping of transport failures onto [`pipeline::LlmError`] live
//! here. Retries, timeouts per attempt and alternate-resource fallback are
//! the `nodes` gateway's job; this crate makes exactly one request per call.
//!
//! ## Initialisation
//!
//! [`OllamaConnector::connect`] lists the endpoint's installed models
//! (`GET /api/tags`) and fails with `LlmError::ResourceUnavailable` when the
//! requested model is absent, which is what switches a stage to its
//! alternate resource.

pub mod ollama;
mod wire;

pub use ollama::{OllamaConnector, OllamaProvider};
