use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::db::schema::SchemaDescription;
use crate::error::PipelineError;
use crate::pipeline::PipelineRun;
use crate::pipeline::history::QueryHistoryItem;
use crate::retrieval::metrics::StrategySummary;
use crate::retrieval::{RetrievalResult, RetrievalStrategy};
use crate::web::state::AppState;

// Request types

#[derive(Debug, Deserialize, Clone)]
pub struct NlQueryRequest {
    pub question: String,
    #[serde(default)]
    pub strategy: Option<RetrievalStrategy>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub question: String,
}

// Response types

#[derive(Debug, Serialize)]
pub struct SchemaRefreshResponse {
    pub table_count: usize,
    pub tables: Vec<String>,
    pub introspected_at: DateTime<Utc>,
}

/// One strategy's pick for a question, without the selected DDL.
#[derive(Debug, Serialize)]
pub struct RetrievalComparison {
    pub strategy: RetrievalStrategy,
    pub tables: Vec<String>,
    pub token_estimate: usize,
    pub full_token_estimate: usize,
    pub token_reduction_pct: f64,
    pub latency_ms: f64,
    pub fell_back: bool,
    pub rationale: String,
}

impl From<&RetrievalResult> for RetrievalComparison {
    fn from(result: &RetrievalResult) -> Self {
        Self {
            strategy: result.strategy,
            tables: result.table_names(),
            token_estimate: result.token_estimate,
            full_token_estimate: result.full_token_estimate,
            token_reduction_pct: result.token_reduction_pct(),
            latency_ms: result.latency_ms,
            fell_back: result.fell_back,
            rationale: result.rationale.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub llm_backend: String,
    pub llm_model: String,
    pub default_strategy: RetrievalStrategy,
    pub table_count: usize,
    pub queries_answered: usize,
}

fn pipeline_error(e: PipelineError) -> (StatusCode, String) {
    error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// API Implementations

/// Runs the question through the pipeline. Rejected and failed runs are still a 200:
/// the run log says which stage stopped it and why.
pub async fn nl_query(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NlQueryRequest>,
) -> Result<Json<PipelineRun>, (StatusCode, String)> {
    debug!("NL-query: {}", payload.question);

    if payload.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "question must not be empty".to_string()));
    }

    let mut options = app_state.assistant.default_options();
    if let Some(strategy) = payload.strategy {
        options.strategy = strategy;
    }
    options.model = payload.model;

    let run = app_state
        .assistant
        .ask(&payload.question, options)
        .await
        .map_err(pipeline_error)?;

    info!("NL-query finished with status {:?}", run.status);
    Ok(Json(run))
}

pub async fn get_schema(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<SchemaDescription>, (StatusCode, String)> {
    let schema = app_state.assistant.schema().await.map_err(pipeline_error)?;
    Ok(Json(schema.as_ref().clone()))
}

pub async fn refresh_schema(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<SchemaRefreshResponse>, (StatusCode, String)> {
    let schema = app_state
        .assistant
        .refresh_schema()
        .await
        .map_err(pipeline_error)?;

    Ok(Json(SchemaRefreshResponse {
        table_count: schema.tables.len(),
        tables: schema.table_names(),
        introspected_at: schema.introspected_at,
    }))
}

pub async fn compare_retrieval(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CompareRequest>,
) -> Result<Json<Vec<RetrievalComparison>>, (StatusCode, String)> {
    if payload.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "question must not be empty".to_string()));
    }

    let results = app_state
        .assistant
        .compare_strategies(&payload.question)
        .await
        .map_err(pipeline_error)?;

    Ok(Json(results.iter().map(RetrievalComparison::from).collect()))
}

pub async fn retrieval_summary(State(app_state): State<Arc<AppState>>) -> Json<Vec<StrategySummary>> {
    Json(app_state.assistant.retrieval_summary())
}

pub async fn query_history(State(app_state): State<Arc<AppState>>) -> Json<Vec<QueryHistoryItem>> {
    Json(app_state.assistant.history())
}

pub async fn system_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemStatus>, (StatusCode, String)> {
    let now = Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    let schema = state.assistant.schema().await.map_err(pipeline_error)?;

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        llm_backend: state.assistant.llm_backend().to_string(),
        llm_model: state.assistant.llm_model().to_string(),
        default_strategy: state.config.retrieval.strategy,
        table_count: schema.tables.len(),
        queries_answered: state.assistant.history().len(),
    }))
}
