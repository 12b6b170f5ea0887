//! Schema retrieval: narrows the schema handed to generation down to the tables a
//! question is likely about.
//!
//! Four strategies implement [`SchemaRetriever`]. [`RetrievalService`] routes a request
//! to one of them, falls back to the full schema when a strategy comes back empty or
//! fails, and records every call in the [`metrics::RetrievalLog`].

pub mod embedding;
pub mod full;
pub mod index_store;
pub mod keyword;
pub mod metrics;
pub mod text;
pub mod vector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::db::schema::SchemaDescription;
use crate::llm::LlmError;

use self::index_store::DuckDbIndexStore;
use self::metrics::RetrievalLog;
use self::vector::{VectorRetriever, VectorSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    #[serde(alias = "none", alias = "no_rag")]
    Full,
    Keyword,
    #[serde(alias = "faiss")]
    Vector,
    #[serde(alias = "chroma", alias = "persistent")]
    PersistentVector,
}

impl RetrievalStrategy {
    pub const ALL: [RetrievalStrategy; 4] = [
        RetrievalStrategy::Full,
        RetrievalStrategy::Keyword,
        RetrievalStrategy::Vector,
        RetrievalStrategy::PersistentVector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Full => "full",
            RetrievalStrategy::Keyword => "keyword",
            RetrievalStrategy::Vector => "vector",
            RetrievalStrategy::PersistentVector => "persistent_vector",
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "full" | "none" | "no_rag" => Ok(RetrievalStrategy::Full),
            "keyword" => Ok(RetrievalStrategy::Keyword),
            "vector" | "faiss" => Ok(RetrievalStrategy::Vector),
            "persistent_vector" | "persistent" | "chroma" => Ok(RetrievalStrategy::PersistentVector),
            other => Err(format!(
                "unknown retrieval strategy '{}' (expected full, keyword, vector or persistent_vector)",
                other
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] LlmError),
    #[error("index store error: {0}")]
    Store(String),
    #[error("retrieval task failed: {0}")]
    Task(String),
}

impl From<duckdb::Error> for RetrievalError {
    fn from(err: duckdb::Error) -> Self {
        RetrievalError::Store(err.to_string())
    }
}

/// Tables picked by one strategy, most relevant first.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub tables: Vec<String>,
    pub rationale: String,
}

#[async_trait]
pub trait SchemaRetriever: Send + Sync {
    fn strategy(&self) -> RetrievalStrategy;

    async fn select(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Selection, RetrievalError>;

    /// Called on schema refresh. Strategies without an index have nothing to do.
    async fn rebuild(&self, _schema: &SchemaDescription) -> Result<(), RetrievalError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub strategy: RetrievalStrategy,
    pub selected: SchemaDescription,
    pub token_estimate: usize,
    pub full_token_estimate: usize,
    pub latency_ms: f64,
    pub rationale: String,
    pub fell_back: bool,
}

impl RetrievalResult {
    pub fn table_names(&self) -> Vec<String> {
        self.selected.table_names()
    }

    pub fn token_reduction_pct(&self) -> f64 {
        if self.full_token_estimate == 0 {
            return 0.0;
        }
        (self.full_token_estimate as f64 - self.token_estimate as f64) * 100.0
            / self.full_token_estimate as f64
    }
}

/// Routes retrieval to the configured strategies and applies the shared contract:
/// never an empty context for a non-empty schema, every call measured and logged.
pub struct RetrievalService {
    retrievers: Vec<Arc<dyn SchemaRetriever>>,
    log: RetrievalLog,
}

impl RetrievalService {
    pub fn new(retrievers: Vec<Arc<dyn SchemaRetriever>>) -> Self {
        Self {
            retrievers,
            log: RetrievalLog::default(),
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Result<Self, RetrievalError> {
        let embedder = embedding::from_config(&config.embedder)?;
        let settings = VectorSettings::from(config);

        let store = DuckDbIndexStore::open(&config.index_path)?;

        let retrievers: Vec<Arc<dyn SchemaRetriever>> = vec![
            Arc::new(full::FullSchemaRetriever),
            Arc::new(keyword::KeywordRetriever::new(config.max_tables, &config.synonyms)),
            Arc::new(VectorRetriever::transient(embedder.clone(), settings.clone())),
            Arc::new(VectorRetriever::persistent(embedder, settings, Arc::new(store))),
        ];

        Ok(Self::new(retrievers))
    }

    pub fn log(&self) -> &RetrievalLog {
        &self.log
    }

    fn retriever(&self, strategy: RetrievalStrategy) -> Option<&Arc<dyn SchemaRetriever>> {
        self.retrievers.iter().find(|r| r.strategy() == strategy)
    }

    pub async fn retrieve(
        &self,
        question: &str,
        schema: &SchemaDescription,
        strategy: RetrievalStrategy,
    ) -> RetrievalResult {
        let result = self.resolve(question, schema, strategy).await;
        self.log.record(question, &result);
        result
    }

    /// Runs every strategy on the same question without touching the log.
    pub async fn compare(&self, question: &str, schema: &SchemaDescription) -> Vec<RetrievalResult> {
        let mut results = Vec::with_capacity(RetrievalStrategy::ALL.len());
        for strategy in RetrievalStrategy::ALL {
            results.push(self.resolve(question, schema, strategy).await);
        }
        results
    }

    /// Rebuilds every index-backed strategy; returns the first failure after trying all.
    pub async fn rebuild_indexes(&self, schema: &SchemaDescription) -> Result<(), RetrievalError> {
        let mut first_error = None;
        for retriever in &self.retrievers {
            if let Err(e) = retriever.rebuild(schema).await {
                warn!("Index rebuild failed for {}: {}", retriever.strategy(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn resolve(
        &self,
        question: &str,
        schema: &SchemaDescription,
        strategy: RetrievalStrategy,
    ) -> RetrievalResult {
        let full_token_estimate = schema.token_estimate();
        let started = Instant::now();

        let outcome = match self.retriever(strategy) {
            Some(retriever) => retriever.select(question, schema).await,
            None => Err(RetrievalError::Task(format!(
                "strategy {} is not configured",
                strategy
            ))),
        };

        let (selected, rationale, fell_back) = match outcome {
            Ok(selection) => {
                let subset = schema.subset(&selection.tables);
                if subset.is_empty() {
                    (
                        schema.clone(),
                        format!("no relevant tables found ({}); using full schema", selection.rationale),
                        strategy != RetrievalStrategy::Full,
                    )
                } else {
                    (subset, selection.rationale, false)
                }
            }
            Err(e) => {
                warn!("{} retrieval failed, falling back to full schema: {}", strategy, e);
                (schema.clone(), format!("retrieval failed ({}); using full schema", e), true)
            }
        };

        let latency_ms = if strategy == RetrievalStrategy::Full {
            0.0
        } else {
            started.elapsed().as_secs_f64() * 1000.0
        };

        let token_estimate = if fell_back || selected.tables.len() == schema.tables.len() {
            full_token_estimate
        } else {
            selected.token_estimate()
        };

        debug!(
            "{} selected {:?} ({} of {} tokens)",
            strategy,
            selected.table_names(),
            token_estimate,
            full_token_estimate
        );

        RetrievalResult {
            strategy,
            selected,
            token_estimate,
            full_token_estimate,
            latency_ms,
            rationale,
            fell_back,
        }
    }
}
