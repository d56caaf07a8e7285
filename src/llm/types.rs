//! Request and response types for local inference
//!
//! These types are independent of any specific engine implementation.

use super::runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Generation parameters supplied by the caller
///
/// Every field participates in the cache fingerprint, so two requests that
/// differ only in, say, temperature are cached separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// System instructions prepended by the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Temperature for response generation (0.0 - 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences to end generation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the system prompt
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets top-p
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Sets the maximum tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets stop sequences
    pub fn with_stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.stop_sequences = sequences;
        self
    }
}

/// A single request forwarded to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub model: String,
    pub prompt: String,
    pub params: GenerationParams,
    pub thread_count: usize,
    pub context_window_tokens: u32,
    pub use_memory_mapping: bool,
}

impl EngineRequest {
    /// Build a request carrying the runtime parameters of `config`
    pub fn new(config: &RuntimeConfig, prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            model: config.model.clone(),
            prompt: prompt.into(),
            params,
            thread_count: config.thread_count,
            context_window_tokens: config.context_window_tokens,
            use_memory_mapping: config.use_memory_mapping,
        }
    }
}

/// Engine output for one request
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    /// Generated text
    pub content: String,
    /// Model that produced the text
    pub model: String,
    /// Tokens generated, when the engine reports it
    pub eval_count: Option<u32>,
    /// Wall time of the request
    pub response_time: Duration,
}

impl EngineResponse {
    pub fn text(
        content: impl Into<String>,
        model: impl Into<String>,
        response_time: Duration,
    ) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            eval_count: None,
            response_time,
        }
    }
}

/// A model present in the engine's local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_builder() {
        let params = GenerationParams::new()
            .with_system("You write Terraform")
            .with_temperature(0.2)
            .with_top_p(0.9)
            .with_max_tokens(1024)
            .with_stop_sequences(vec!["```".to_string()]);

        assert_eq!(params.system.as_deref(), Some("You write Terraform"));
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.top_p, Some(0.9));
        assert_eq!(params.max_tokens, Some(1024));
        assert_eq!(params.stop_sequences.len(), 1);
    }

    #[test]
    fn test_engine_request_carries_runtime_config() {
        let config = RuntimeConfig {
            model: "llama3.2:3b".to_string(),
            thread_count: 6,
            context_window_tokens: 4096,
            use_memory_mapping: false,
            cache_capacity_entries: 100,
            cache_capacity_bytes: 1024,
            request_timeout_seconds: 30,
        };

        let request = EngineRequest::new(&config, "hello", GenerationParams::default());
        assert_eq!(request.model, "llama3.2:3b");
        assert_eq!(request.thread_count, 6);
        assert_eq!(request.context_window_tokens, 4096);
        assert!(!request.use_memory_mapping);
    }

    #[test]
    fn test_default_params_serialize_compactly() {
        let json = serde_json::to_string(&GenerationParams::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
