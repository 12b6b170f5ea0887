use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::text::{terms, words};
use crate::config::EmbedderConfig;
use crate::llm::LlmError;

const DEFAULT_EMBED_URL: &str = "http://localhost:11434/api/embed";
const TRIGRAM_WEIGHT: f32 = 0.2;

/// Turns text into fixed-length vectors. Vectors from different ids are not comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the model and its dimensionality; persisted next to stored vectors.
    fn id(&self) -> String;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

pub fn from_config(config: &EmbedderConfig) -> Result<Arc<dyn Embedder>, LlmError> {
    match config.backend.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => Err(LlmError::ConfigError(format!(
            "Unsupported embedder backend: {}",
            other
        ))),
    }
}

/// In-process feature hashing over stemmed words and character trigrams.
/// Needs no model server, so it is the default.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(16),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];

        for term in terms(text) {
            self.add_feature(&mut vector, &term, 1.0);
        }
        for word in words(text) {
            let padded: Vec<char> = format!("#{}#", word).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, &gram, TRIGRAM_WEIGHT);
            }
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn id(&self) -> String {
        format!("hashing-{}", self.dimensions)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity; zero when either side has no magnitude or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Sentence embeddings from an Ollama server.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbedderConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_EMBED_URL.to_string()),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn id(&self) -> String {
        format!("ollama-{}", self.model)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        info!("Embedding {} texts with {}", texts.len(), self.model);

        let response = self
            .client
            .post(&self.api_url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            error!("Embedding endpoint responded with status code: {}", status);
            return Err(LlmError::ResponseError(format!(
                "Embedding endpoint responded with status code: {}",
                status
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to parse embeddings: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(LlmError::ResponseError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        debug!("Received {} embeddings", parsed.embeddings.len());
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_texts_score_higher() {
        let embedder = HashingEmbedder::new(256);
        let orders = embedder.embed_one("Table: orders. Columns: order date, total, customer id");
        let carriers = embedder.embed_one("Table: shipping_carriers. Columns: name, phone");
        let question = embedder.embed_one("total of orders last month");

        assert!(cosine_similarity(&question, &orders) > cosine_similarity(&question, &carriers));
    }

    #[test]
    fn vectors_are_unit_length() {
        let embedder = HashingEmbedder::new(64);
        let v = embedder.embed_one("customers by city");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert_eq!(cosine_similarity(&v, &vec![0.0; 64]), 0.0);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let config = EmbedderConfig {
            backend: "word2vec".to_string(),
            ..EmbedderConfig::default()
        };
        assert!(matches!(from_config(&config), Err(LlmError::ConfigError(_))));
    }
}
