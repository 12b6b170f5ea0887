use crate::config::LlmConfig;
use crate::llm::{Completion, CompletionRequest, CompletionService, LlmError, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

const DEFAULT_API_URL: &str = "http://localhost:11434/api/generate";

/// Locally-run model served by Ollama.
pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionService for OllamaProvider {
    fn backend(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        let model = request.model.unwrap_or(&self.model);
        info!("Sending request to Ollama with model: {}", model);
        debug!("API URL: {}", self.api_url);

        let body = OllamaRequest {
            model,
            prompt: request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", response_text);

        let ollama_response = parse_response(&response_text)?;

        let usage = match (ollama_response.prompt_eval_count, ollama_response.eval_count) {
            (Some(prompt), Some(completion)) => TokenUsage::new(prompt, completion),
            _ => TokenUsage::estimated(request.prompt, &ollama_response.response),
        };

        Ok(Completion {
            text: ollama_response.response,
            usage,
            model: ollama_response.model.unwrap_or_else(|| model.to_string()),
        })
    }
}

fn parse_response(response_text: &str) -> Result<OllamaResponse, LlmError> {
    serde_json::from_str::<OllamaResponse>(response_text).map_err(|e| {
        error!("Failed to parse Ollama response: {} - Response was: {}", e, response_text);
        LlmError::ResponseError(format!(
            "Failed to parse Ollama response: {} - Response was: {}",
            e, response_text
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_response_with_counts() {
        let raw = r#"{"model":"sqlcoder","created_at":"2024-04-01T00:00:00Z","response":"SELECT 1;","done":true,"prompt_eval_count":40,"eval_count":5}"#;
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.response, "SELECT 1;");
        assert_eq!(parsed.prompt_eval_count, Some(40));
        assert_eq!(parsed.eval_count, Some(5));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_response("<html>oops</html>"),
            Err(LlmError::ResponseError(_))
        ));
    }
}
