pub mod extract;
pub mod providers;

use crate::config::{LlmConfig, PricingConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Rough usage for backends that do not report token counts.
    pub fn estimated(prompt: &str, completion: &str) -> Self {
        Self::new(estimate_tokens(prompt) as u64, estimate_tokens(completion) as u64)
    }
}

/// Four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Converts token usage into currency.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl CostModel {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

impl From<PricingConfig> for CostModel {
    fn from(pricing: PricingConfig) -> Self {
        Self {
            input_per_1k: pricing.input_per_1k,
            output_per_1k: pricing.output_per_1k,
        }
    }
}

impl Default for CostModel {
    fn default() -> Self {
        PricingConfig::default().into()
    }
}

pub struct CompletionRequest<'a> {
    pub prompt: &'a str,
    /// Overrides the backend's configured model for this call.
    pub model: Option<&'a str>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(prompt: &'a str) -> Self {
        Self {
            prompt,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<&'a str>) -> Self {
        self.model = model;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Black-box text completion: one prompt in, free text and token usage out.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn backend(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError>;
}

/// Builds the completion backend named in the configuration.
pub fn from_config(config: &LlmConfig) -> Result<Arc<dyn CompletionService>, LlmError> {
    let service: Arc<dyn CompletionService> = match config.backend.as_str() {
        "remote" => Arc::new(providers::remote::RemoteLlmProvider::new(config)?),
        "ollama" | "local" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
        _ => {
            return Err(LlmError::ConfigError(format!(
                "Unsupported LLM backend: {}",
                config.backend
            )));
        }
    };

    Ok(service)
}
