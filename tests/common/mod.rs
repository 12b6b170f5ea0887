#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use sqlcrew::assistant::Assistant;
use sqlcrew::config::AppConfig;
use sqlcrew::db::db_pool::{DbPool, build_pool};
use sqlcrew::llm::{Completion, CompletionRequest, CompletionService, LlmError, TokenUsage};
use sqlcrew::retrieval::RetrievalService;

pub const SEED_SQL: &str = "
CREATE TABLE customers (id INTEGER PRIMARY KEY, name VARCHAR, email VARCHAR, city VARCHAR);
CREATE TABLE products (id INTEGER PRIMARY KEY, name VARCHAR, category VARCHAR, price DOUBLE);
CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    customer_id INTEGER REFERENCES customers(id),
    order_date DATE,
    total DOUBLE
);
CREATE TABLE order_items (
    id INTEGER PRIMARY KEY,
    order_id INTEGER REFERENCES orders(id),
    product_id INTEGER,
    quantity INTEGER,
    unit_price DOUBLE
);
CREATE TABLE shipping_carriers (id INTEGER PRIMARY KEY, name VARCHAR, phone VARCHAR);

INSERT INTO customers VALUES
    (1, 'Ada', 'ada@example.com', 'London'),
    (2, 'Grace', 'grace@example.com', 'New York'),
    (3, 'Linus', 'linus@example.com', 'Helsinki');
INSERT INTO products VALUES (1, 'Keyboard', 'hardware', 49.5), (2, 'Mouse', 'hardware', 19.0);
INSERT INTO orders VALUES
    (1, 1, DATE '2024-01-05', 68.5),
    (2, 2, DATE '2024-02-10', 49.5);
INSERT INTO order_items VALUES (1, 1, 1, 1, 49.5), (2, 1, 2, 1, 19.0), (3, 2, 1, 1, 49.5);
INSERT INTO shipping_carriers VALUES (1, 'FastShip', '555-0100');
";

/// Completion double that answers from a script, in order, and remembers the prompts.
#[derive(Default)]
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn backend(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        self.prompts.lock().unwrap().push(request.prompt.to_string());
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::ResponseError("script exhausted".to_string()))?;
        Ok(Completion {
            usage: TokenUsage::estimated(request.prompt, &text),
            text,
            model: request.model.unwrap_or("scripted-model").to_string(),
        })
    }
}

/// A seeded on-disk database plus a config pointing at it.
pub struct Fixture {
    pub pool: DbPool,
    pub config: AppConfig,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.connection_string = dir.path().join("shop.duckdb").to_str().unwrap().to_string();
        config.retrieval.index_path = dir.path().join("index").join("schema_index.duckdb").to_str().unwrap().to_string();

        let pool = build_pool(&config.database.connection_string, 2).unwrap();
        pool.get().unwrap().execute_batch(SEED_SQL).unwrap();

        Self { pool, config, dir }
    }

    pub fn assistant(&self, llm: Arc<ScriptedCompletion>) -> Assistant {
        let retrieval = Arc::new(RetrievalService::from_config(&self.config.retrieval).unwrap());
        Assistant::with_services(&self.config, self.pool.clone(), llm, retrieval)
    }
}
