use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Pipeline
            .route("/nl-query", post(handlers::api::nl_query))
            .route("/history", get(handlers::api::query_history))
            // Schema management
            .route("/schema", get(handlers::api::get_schema))
            .route("/schema/refresh", post(handlers::api::refresh_schema))
            // Retrieval comparison
            .route("/retrieval/compare", post(handlers::api::compare_retrieval))
            .route("/retrieval/summary", get(handlers::api::retrieval_summary))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
