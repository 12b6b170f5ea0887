use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::embedding::{Embedder, cosine_similarity};
use super::index_store::DuckDbIndexStore;
use super::{RetrievalError, RetrievalStrategy, SchemaRetriever, Selection};
use crate::config::RetrievalConfig;
use crate::db::schema::SchemaDescription;

#[derive(Debug, Clone)]
pub struct VectorSettings {
    pub max_tables: usize,
    pub threshold: f32,
    /// Business context per table, folded into the embedded description.
    pub descriptions: HashMap<String, String>,
}

impl From<&RetrievalConfig> for VectorSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            max_tables: config.max_tables.max(1),
            threshold: config.similarity_threshold,
            descriptions: config.table_descriptions.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub table: String,
    pub document: String,
    pub vector: Vec<f32>,
}

/// Immutable once built; replaced wholesale on rebuild.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    pub embedder_id: String,
    pub entries: Vec<IndexEntry>,
    pub built_at: DateTime<Utc>,
}

impl VectorIndex {
    /// Whether this index was built by `embedder_id` from exactly these documents.
    pub fn matches(&self, embedder_id: &str, documents: &[(String, String)]) -> bool {
        self.embedder_id == embedder_id
            && self.entries.len() == documents.len()
            && self
                .entries
                .iter()
                .zip(documents)
                .all(|(entry, (table, document))| &entry.table == table && &entry.document == document)
    }

    /// Up to `k` tables scoring at or above `threshold`, best first.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .entries
            .iter()
            .map(|e| (e.table.clone(), cosine_similarity(query, &e.vector)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }
}

/// Current index snapshot plus the lock that serializes rebuilds.
/// Readers clone the `Arc` and never wait on a rebuild in progress.
#[derive(Default)]
struct IndexSlot {
    current: RwLock<Option<Arc<VectorIndex>>>,
    rebuild: Mutex<()>,
}

impl IndexSlot {
    fn snapshot(&self) -> Option<Arc<VectorIndex>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, index: Arc<VectorIndex>) {
        match self.current.write() {
            Ok(mut guard) => *guard = Some(index),
            Err(poisoned) => *poisoned.into_inner() = Some(index),
        }
    }
}

/// Semantic table matching over embedded table descriptions. The transient flavor
/// keeps its index in memory only; the persistent one also writes it to a
/// [`DuckDbIndexStore`] and reloads it instead of re-embedding.
pub struct VectorRetriever {
    strategy: RetrievalStrategy,
    embedder: Arc<dyn Embedder>,
    store: Option<Arc<DuckDbIndexStore>>,
    settings: VectorSettings,
    slot: IndexSlot,
}

impl VectorRetriever {
    pub fn transient(embedder: Arc<dyn Embedder>, settings: VectorSettings) -> Self {
        Self {
            strategy: RetrievalStrategy::Vector,
            embedder,
            store: None,
            settings,
            slot: IndexSlot::default(),
        }
    }

    pub fn persistent(
        embedder: Arc<dyn Embedder>,
        settings: VectorSettings,
        store: Arc<DuckDbIndexStore>,
    ) -> Self {
        Self {
            strategy: RetrievalStrategy::PersistentVector,
            embedder,
            store: Some(store),
            settings,
            slot: IndexSlot::default(),
        }
    }

    /// Snapshot of the index currently served, if one has been built or loaded.
    pub fn current_index(&self) -> Option<Arc<VectorIndex>> {
        self.slot.snapshot()
    }

    fn documents(&self, schema: &SchemaDescription) -> Vec<(String, String)> {
        schema
            .tables
            .iter()
            .map(|t| {
                let context = self.settings.descriptions.get(&t.name).map(String::as_str);
                (t.name.clone(), t.to_embedding_text(context))
            })
            .collect()
    }

    async fn ensure_index(
        &self,
        schema: &SchemaDescription,
        force: bool,
    ) -> Result<Arc<VectorIndex>, RetrievalError> {
        let embedder_id = self.embedder.id();
        let documents = self.documents(schema);

        if !force {
            if let Some(index) = self.slot.snapshot().filter(|i| i.matches(&embedder_id, &documents)) {
                return Ok(index);
            }
        }

        let _guard = self.slot.rebuild.lock().await;

        // Another caller may have finished the rebuild while we waited
        if !force {
            if let Some(index) = self.slot.snapshot().filter(|i| i.matches(&embedder_id, &documents)) {
                return Ok(index);
            }
        }

        if let (Some(store), false) = (&self.store, force) {
            let store = store.clone();
            let stored = tokio::task::spawn_blocking(move || store.load())
                .await
                .map_err(|e| RetrievalError::Task(e.to_string()))??;
            if let Some(index) = stored.filter(|i| i.matches(&embedder_id, &documents)) {
                info!("{}: reusing stored index of {} tables", self.strategy, index.entries.len());
                let index = Arc::new(index);
                self.slot.swap(index.clone());
                return Ok(index);
            }
        }

        let texts: Vec<String> = documents.iter().map(|(_, d)| d.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        if vectors.len() != documents.len() {
            return Err(RetrievalError::Store(format!(
                "embedder returned {} vectors for {} tables",
                vectors.len(),
                documents.len()
            )));
        }

        let index = Arc::new(VectorIndex {
            embedder_id,
            entries: documents
                .into_iter()
                .zip(vectors)
                .map(|((table, document), vector)| IndexEntry {
                    table,
                    document,
                    vector,
                })
                .collect(),
            built_at: Utc::now(),
        });

        if let Some(store) = &self.store {
            let store = store.clone();
            let to_save = index.clone();
            tokio::task::spawn_blocking(move || store.save(&to_save))
                .await
                .map_err(|e| RetrievalError::Task(e.to_string()))??;
        }

        info!("{}: built index of {} tables", self.strategy, index.entries.len());
        self.slot.swap(index.clone());
        Ok(index)
    }
}

#[async_trait]
impl SchemaRetriever for VectorRetriever {
    fn strategy(&self) -> RetrievalStrategy {
        self.strategy
    }

    async fn select(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Selection, RetrievalError> {
        let index = self.ensure_index(schema, false).await?;

        let query = self.embedder.embed(&[question.to_string()]).await?;
        let Some(query) = query.first() else {
            return Err(RetrievalError::Store("embedder returned no query vector".to_string()));
        };

        let hits = index.search(query, self.settings.max_tables, self.settings.threshold);
        debug!("{} hits: {:?}", self.strategy, hits);

        let rationale = if hits.is_empty() {
            format!("no table above similarity {:.2}", self.settings.threshold)
        } else {
            hits.iter()
                .map(|(table, score)| format!("{} ({:.3})", table, score))
                .collect::<Vec<_>>()
                .join(", ")
        };

        Ok(Selection {
            tables: hits.into_iter().map(|(table, _)| table).collect(),
            rationale,
        })
    }

    async fn rebuild(&self, schema: &SchemaDescription) -> Result<(), RetrievalError> {
        self.ensure_index(schema, true).await.map(|_| ())
    }
}
