mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use common::{Fixture, ScriptedCompletion};
use sqlcrew::web::{self, state::AppState};

fn router(fixture: &Fixture, llm: Arc<ScriptedCompletion>) -> Router {
    let assistant = fixture.assistant(llm);
    web::app(Arc::new(AppState::new(fixture.config.clone(), assistant)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::String(
        String::from_utf8_lossy(&bytes).into_owned(),
    ));
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn nl_query_returns_the_run_log() {
    let fixture = Fixture::new();
    let app = router(
        &fixture,
        ScriptedCompletion::new(&["SELECT name FROM customers ORDER BY id;", "UNCHANGED"]),
    );

    let (status, body) = send(
        &app,
        post("/api/nl-query", json!({"question": "customer names", "strategy": "keyword"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["strategy"], "keyword");
    let stages = body["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 5);
    assert_eq!(stages[0]["stage"], "retrieve");
    assert_eq!(stages[0]["payload"]["type"], "retrieval");
    assert_eq!(stages[4]["payload"]["type"], "rows");
    assert_eq!(stages[4]["payload"]["rows"][0][0], "Ada");

    let (status, history) = send(&app, get("/api/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["question"], "customer names");
}

#[tokio::test]
async fn rejected_runs_are_reported_not_errors() {
    let fixture = Fixture::new();
    let app = router(&fixture, ScriptedCompletion::new(&["DROP TABLE orders;", "UNCHANGED"]));

    let (status, body) = send(&app, post("/api/nl-query", json!({"question": "drop orders"}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rejected");
    let terminal = body["stages"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(terminal["stage"], "comply");
    assert_eq!(terminal["payload"]["type"], "rejection");
    assert_eq!(terminal["payload"]["rule"], "forbidden_verb");
}

#[tokio::test]
async fn empty_question_is_a_bad_request() {
    let fixture = Fixture::new();
    let app = router(&fixture, ScriptedCompletion::new(&[]));

    let (status, _) = send(&app, post("/api/nl-query", json!({"question": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post("/api/retrieval/compare", json!({"question": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn schema_endpoints_describe_and_refresh() {
    let fixture = Fixture::new();
    let app = router(&fixture, ScriptedCompletion::new(&[]));

    let (status, schema) = send(&app, get("/api/schema")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(schema["tables"].as_array().unwrap().len(), 5);

    fixture
        .pool
        .get()
        .unwrap()
        .execute_batch("CREATE TABLE warehouses (id INTEGER PRIMARY KEY, city VARCHAR);")
        .unwrap();

    // The snapshot is kept until a refresh
    let (_, schema) = send(&app, get("/api/schema")).await;
    assert_eq!(schema["tables"].as_array().unwrap().len(), 5);

    let (status, refreshed) = send(&app, post("/api/schema/refresh", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refreshed["table_count"], 6);
    assert!(
        refreshed["tables"]
            .as_array()
            .unwrap()
            .contains(&json!("warehouses"))
    );
}

#[tokio::test]
async fn compare_lists_every_strategy() {
    let fixture = Fixture::new();
    let app = router(&fixture, ScriptedCompletion::new(&[]));

    let (status, body) = send(
        &app,
        post("/api/retrieval/compare", json!({"question": "What is the order total?"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let strategies: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["strategy"].as_str().unwrap())
        .collect();
    assert_eq!(strategies, vec!["full", "keyword", "vector", "persistent_vector"]);
    assert!(body[1]["token_estimate"].as_u64() < body[0]["token_estimate"].as_u64());

    let (status, summary) = send(&app, get("/api/retrieval/summary")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(summary.as_array().unwrap().iter().all(|s| s["queries_processed"] == 0));
}

#[tokio::test]
async fn status_reports_backend_and_tables() {
    let fixture = Fixture::new();
    let app = router(&fixture, ScriptedCompletion::new(&[]));

    let (status, body) = send(&app, get("/api/status")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["table_count"], 5);
    assert_eq!(body["queries_answered"], 0);
    assert_eq!(body["default_strategy"], "keyword");
    assert_eq!(body["llm_backend"], "scripted");
    assert_eq!(body["llm_model"], "scripted-model");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
