mod common;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Fixture, ScriptedCompletion};
use sqlcrew::db::catalog::SchemaCatalog;
use sqlcrew::llm::LlmError;
use sqlcrew::retrieval::embedding::{Embedder, HashingEmbedder};
use sqlcrew::retrieval::index_store::DuckDbIndexStore;
use sqlcrew::retrieval::vector::{VectorRetriever, VectorSettings};
use sqlcrew::retrieval::{RetrievalStrategy, SchemaRetriever};

/// Counts how many texts went through the wrapped embedder.
struct CountingEmbedder {
    inner: HashingEmbedder,
    embedded: AtomicUsize,
}

impl CountingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashingEmbedder::new(256),
            embedded: AtomicUsize::new(0),
        })
    }

    fn embedded(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn id(&self) -> String {
        self.inner.id()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

fn settings() -> VectorSettings {
    VectorSettings {
        max_tables: 3,
        threshold: 0.1,
        descriptions: HashMap::new(),
    }
}

#[tokio::test]
async fn catalog_reads_keys_and_flags_personal_data() {
    let fixture = Fixture::new();
    let catalog = SchemaCatalog::new(fixture.pool.clone(), &fixture.config.catalog);
    let schema = catalog.describe().await.unwrap();

    assert_eq!(
        schema.table_names(),
        vec!["customers", "order_items", "orders", "products", "shipping_carriers"]
    );

    let customers = schema.table("customers").unwrap();
    assert!(customers.column("id").unwrap().primary_key);
    assert!(customers.column("email").unwrap().sensitive);
    assert!(!customers.column("city").unwrap().sensitive);
    assert!(schema.table("shipping_carriers").unwrap().column("phone").unwrap().sensitive);

    let declared = schema
        .table("orders")
        .unwrap()
        .column("customer_id")
        .unwrap()
        .references
        .clone()
        .unwrap();
    assert_eq!(declared.table, "customers");
    assert_eq!(declared.column, "id");
    assert!(!declared.inferred);

    let inferred = schema
        .table("order_items")
        .unwrap()
        .column("product_id")
        .unwrap()
        .references
        .clone()
        .unwrap();
    assert_eq!(inferred.table, "products");
    assert!(inferred.inferred);

    let ddl = schema.to_prompt_context();
    assert!(ddl.contains("CREATE TABLE orders"));
    assert!(ddl.contains("REFERENCES customers(id)"));
}

#[tokio::test]
async fn catalog_sees_structural_changes_on_next_describe() {
    let fixture = Fixture::new();
    let catalog = SchemaCatalog::new(fixture.pool.clone(), &fixture.config.catalog);
    let before = catalog.describe().await.unwrap();

    fixture
        .pool
        .get()
        .unwrap()
        .execute_batch("CREATE TABLE warehouses (id INTEGER PRIMARY KEY, city VARCHAR);")
        .unwrap();

    let after = catalog.describe().await.unwrap();
    assert_eq!(after.tables.len(), before.tables.len() + 1);
    assert!(after.table("warehouses").is_some());
}

#[tokio::test]
async fn every_strategy_returns_a_usable_context() {
    let fixture = Fixture::new();
    let assistant = fixture.assistant(ScriptedCompletion::new(&[]));
    let schema = assistant.schema().await.unwrap();

    let results = assistant
        .compare_strategies("zebra migration patterns")
        .await
        .unwrap();
    assert_eq!(results.len(), RetrievalStrategy::ALL.len());

    for result in &results {
        assert!(!result.selected.is_empty(), "{} came back empty", result.strategy);
        if result.fell_back {
            assert_eq!(result.table_names(), schema.table_names());
            assert_eq!(result.token_estimate, result.full_token_estimate);
        }
    }

    let full = &results[0];
    assert_eq!(full.strategy, RetrievalStrategy::Full);
    assert!(!full.fell_back);
    assert_eq!(full.latency_ms, 0.0);

    let keyword = &results[1];
    assert_eq!(keyword.strategy, RetrievalStrategy::Keyword);
    assert!(keyword.fell_back);

    // Comparison does not feed the metrics
    assert!(assistant.retrieval_summary().iter().all(|s| s.queries_processed == 0));
}

#[tokio::test]
async fn summary_tracks_pipeline_retrievals() {
    let fixture = Fixture::new();
    let llm = ScriptedCompletion::new(&[
        "SELECT SUM(total) FROM orders;",
        "UNCHANGED",
        "SELECT COUNT(*) FROM customers;",
        "UNCHANGED",
    ]);
    let assistant = fixture.assistant(llm);
    let mut options = assistant.default_options();
    options.strategy = RetrievalStrategy::Keyword;

    assistant.ask("order total", options.clone()).await.unwrap();
    assistant.ask("how many customers", options).await.unwrap();

    let summary = assistant.retrieval_summary();
    let keyword = summary
        .iter()
        .find(|s| s.strategy == RetrievalStrategy::Keyword)
        .unwrap();
    assert_eq!(keyword.queries_processed, 2);
    assert!(keyword.avg_token_reduction > 0.0);
    assert_eq!(keyword.fallbacks, 0);
}

#[tokio::test]
async fn persistent_index_is_reloaded_without_re_embedding() {
    let fixture = Fixture::new();
    let catalog = SchemaCatalog::new(fixture.pool.clone(), &fixture.config.catalog);
    let schema = catalog.describe().await.unwrap();
    let path = fixture.dir.path().join("persisted").join("index.duckdb");
    let path = path.to_str().unwrap();

    let first_embedder = CountingEmbedder::new();
    {
        let store = Arc::new(DuckDbIndexStore::open(path).unwrap());
        let retriever = VectorRetriever::persistent(first_embedder.clone(), settings(), store);
        retriever.rebuild(&schema).await.unwrap();
    }
    assert_eq!(first_embedder.embedded(), schema.tables.len());

    // A fresh process: new store handle, new retriever, same file
    let second_embedder = CountingEmbedder::new();
    let store = Arc::new(DuckDbIndexStore::open(path).unwrap());
    let retriever = VectorRetriever::persistent(second_embedder.clone(), settings(), store);
    let selection = retriever.select("total of orders", &schema).await.unwrap();

    // Only the question itself was embedded
    assert_eq!(second_embedder.embedded(), 1);
    assert!(selection.tables.contains(&"orders".to_string()));
    assert_eq!(retriever.current_index().unwrap().entries.len(), schema.tables.len());
}

#[tokio::test]
async fn stale_persistent_index_is_rebuilt() {
    let fixture = Fixture::new();
    let catalog = SchemaCatalog::new(fixture.pool.clone(), &fixture.config.catalog);
    let path = fixture.dir.path().join("stale.duckdb");
    let path = path.to_str().unwrap();

    let before = catalog.describe().await.unwrap();
    {
        let store = Arc::new(DuckDbIndexStore::open(path).unwrap());
        let retriever = VectorRetriever::persistent(CountingEmbedder::new(), settings(), store);
        retriever.rebuild(&before).await.unwrap();
    }

    fixture
        .pool
        .get()
        .unwrap()
        .execute_batch("CREATE TABLE warehouses (id INTEGER PRIMARY KEY, city VARCHAR);")
        .unwrap();
    let after = catalog.describe().await.unwrap();

    let embedder = CountingEmbedder::new();
    let store = Arc::new(DuckDbIndexStore::open(path).unwrap());
    let retriever = VectorRetriever::persistent(embedder.clone(), settings(), store.clone());
    retriever.select("warehouse cities", &after).await.unwrap();

    // Every table re-embedded, plus the question
    assert_eq!(embedder.embedded(), after.tables.len() + 1);
    let stored = store.load().unwrap().unwrap();
    assert_eq!(stored.entries.len(), after.tables.len());
    assert!(stored.entries.iter().any(|e| e.table == "warehouses"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_a_whole_index_while_it_is_rebuilt() {
    let fixture = Fixture::new();
    let catalog = SchemaCatalog::new(fixture.pool.clone(), &fixture.config.catalog);
    let schema = Arc::new(catalog.describe().await.unwrap());
    let path = fixture.dir.path().join("concurrent.duckdb");
    let store = Arc::new(DuckDbIndexStore::open(path.to_str().unwrap()).unwrap());
    let retriever = Arc::new(VectorRetriever::persistent(CountingEmbedder::new(), settings(), store));
    retriever.rebuild(&schema).await.unwrap();

    let rebuilder = {
        let (retriever, schema) = (retriever.clone(), schema.clone());
        tokio::spawn(async move {
            for _ in 0..5 {
                retriever.rebuild(&schema).await.unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let (retriever, schema) = (retriever.clone(), schema.clone());
            tokio::spawn(async move {
                for _ in 0..10 {
                    let selection = retriever.select("total of orders", &schema).await.unwrap();
                    assert!(selection.tables.contains(&"orders".to_string()));
                    let index = retriever.current_index().unwrap();
                    assert_eq!(index.entries.len(), schema.tables.len());
                }
            })
        })
        .collect();

    rebuilder.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}
