use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::catalog::SchemaCatalog;
use crate::db::db_pool::{DbPool, build_pool};
use crate::db::schema::SchemaDescription;
use crate::error::PipelineError;
use crate::llm::{self, CompletionService, CostModel};
use crate::pipeline::compliance::ComplianceChecker;
use crate::pipeline::execute::QueryExecutor;
use crate::pipeline::history::{QueryHistory, QueryHistoryItem};
use crate::pipeline::stage::StageResult;
use crate::pipeline::{Pipeline, PipelineRequest, PipelineRun, SessionOptions};
use crate::retrieval::metrics::StrategySummary;
use crate::retrieval::{RetrievalError, RetrievalResult, RetrievalService};

/// Owns the live schema snapshot, the pipeline and the query history. This is what the
/// CLI and the HTTP handlers talk to.
pub struct Assistant {
    catalog: SchemaCatalog,
    pipeline: Arc<Pipeline>,
    schema: RwLock<Option<Arc<SchemaDescription>>>,
    history: Arc<QueryHistory>,
    default_options: SessionOptions,
}

impl Assistant {
    pub fn from_config(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "Opening database {} (pool size {})",
            config.database.connection_string, config.database.pool_size
        );
        let pool = build_pool(&config.database.connection_string, config.database.pool_size)?;

        info!("Initializing LLM backend: {} ({})", config.llm.backend, config.llm.model);
        let llm = llm::from_config(&config.llm)?;

        let retrieval = Arc::new(RetrievalService::from_config(&config.retrieval)?);
        Ok(Self::with_services(config, pool, llm, retrieval))
    }

    /// Assembles an assistant around already-built services.
    pub fn with_services(
        config: &AppConfig,
        pool: DbPool,
        llm: Arc<dyn CompletionService>,
        retrieval: Arc<RetrievalService>,
    ) -> Self {
        let pipeline = Pipeline::new(
            retrieval,
            llm,
            ComplianceChecker::from(&config.compliance),
            QueryExecutor::new(pool.clone(), &config.execution),
            CostModel::from(config.llm.pricing),
        );

        Self {
            catalog: SchemaCatalog::new(pool, &config.catalog),
            pipeline: Arc::new(pipeline),
            schema: RwLock::new(None),
            history: Arc::new(QueryHistory::new(config.history.capacity)),
            default_options: SessionOptions {
                strategy: config.retrieval.strategy,
                model: None,
            },
        }
    }

    pub fn default_options(&self) -> SessionOptions {
        self.default_options.clone()
    }

    /// Current schema snapshot, introspecting once if none has been taken yet.
    pub async fn schema(&self) -> Result<Arc<SchemaDescription>, PipelineError> {
        if let Some(schema) = self.schema.read().await.as_ref() {
            return Ok(schema.clone());
        }

        let mut slot = self.schema.write().await;
        if let Some(schema) = slot.as_ref() {
            return Ok(schema.clone());
        }
        let schema = Arc::new(self.catalog.describe().await?);
        *slot = Some(schema.clone());
        Ok(schema)
    }

    /// Re-reads the database structure and rebuilds the vector indexes against it.
    /// An index that fails to rebuild is logged; retrieval falls back until it succeeds.
    pub async fn refresh_schema(&self) -> Result<Arc<SchemaDescription>, PipelineError> {
        let schema = Arc::new(self.catalog.describe().await?);
        *self.schema.write().await = Some(schema.clone());

        if let Err(e) = self.pipeline.retrieval().rebuild_indexes(&schema).await {
            warn!("Schema refreshed but index rebuild failed: {}", e);
        }
        Ok(schema)
    }

    pub async fn rebuild_indexes(&self) -> Result<(), RetrievalError> {
        let schema = self
            .schema()
            .await
            .map_err(|e| RetrievalError::Task(e.to_string()))?;
        self.pipeline.retrieval().rebuild_indexes(&schema).await
    }

    async fn request(
        &self,
        question: &str,
        options: SessionOptions,
    ) -> Result<PipelineRequest, PipelineError> {
        Ok(PipelineRequest {
            question: question.to_string(),
            schema: self.schema().await?,
            options,
        })
    }

    /// Runs the pipeline to completion and records it in the history.
    pub async fn ask(
        &self,
        question: &str,
        options: SessionOptions,
    ) -> Result<PipelineRun, PipelineError> {
        let request = self.request(question, options).await?;
        let run = self.pipeline.run(request).await;
        self.history.push(&run);
        Ok(run)
    }

    /// Starts a run on its own task. Stage results arrive on the receiver as they are
    /// recorded; the handle yields the finished run once it is in the history.
    pub async fn submit(
        &self,
        question: &str,
        options: SessionOptions,
    ) -> Result<(mpsc::UnboundedReceiver<StageResult>, JoinHandle<PipelineRun>), PipelineError> {
        let request = self.request(question, options).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(&self.pipeline);
        let history = Arc::clone(&self.history);

        let handle = tokio::spawn(async move {
            let run = pipeline.run_observed(request, Some(&tx)).await;
            history.push(&run);
            run
        });
        Ok((rx, handle))
    }

    /// Every retrieval strategy on the same question, without recording metrics.
    pub async fn compare_strategies(
        &self,
        question: &str,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let schema = self.schema().await?;
        Ok(self.pipeline.retrieval().compare(question, &schema).await)
    }

    pub fn llm_backend(&self) -> &str {
        self.pipeline.backend()
    }

    pub fn llm_model(&self) -> &str {
        self.pipeline.default_model()
    }

    pub fn retrieval_summary(&self) -> Vec<StrategySummary> {
        self.pipeline.retrieval().log().summary()
    }

    pub fn history(&self) -> Vec<QueryHistoryItem> {
        self.history.items()
    }
}
