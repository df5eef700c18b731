//! HTTP surface driven through the router without a listener.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use backtest_orchestrator::app::create_app;
use backtest_orchestrator::config::AppMode;
use backtest_orchestrator::db::InMemoryTaskRepository;
use backtest_orchestrator::external::broker::InMemoryBroker;
use backtest_orchestrator::services::schedule_manager::ScheduleManager;
use backtest_orchestrator::services::status_gateway::RealtimeStatusGateway;
use backtest_orchestrator::services::task_submission::TaskSubmissionService;
use backtest_orchestrator::state::AppState;

async fn setup_test_app() -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(InMemoryBroker::default());
    let repository = Arc::new(InMemoryTaskRepository::new());
    let schedules = ScheduleManager::new(
        broker.clone(),
        dir.path().join("schedules.json"),
        chrono_tz::UTC,
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let state = AppState {
        mode: AppMode::Api,
        repository: repository.clone(),
        submission: TaskSubmissionService::new(broker.clone(), repository.clone()),
        gateway: RealtimeStatusGateway::new(broker, repository, Duration::from_millis(5)),
        schedules: Arc::new(schedules),
    };
    (create_app(state), dir)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Task submission and status
// ============================================================================

#[tokio::test]
async fn test_submitted_task_is_pending_and_readable() {
    let (app, _dir) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(post("/api/tasks/cleanup", json!({"retention_days": 7})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let submission = json_body(response).await;
    assert_eq!(submission["state"], "PENDING");
    let task_id = submission["task_id"].as_str().unwrap().to_string();

    let response = app.oneshot(get(&format!("/api/tasks/{}", task_id))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = json_body(response).await;
    assert_eq!(envelope["id"], task_id.as_str());
    assert_eq!(envelope["state"], "PENDING");
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let (app, _dir) = setup_test_app().await;
    let response = app.oneshot(get("/api/tasks/does-not-exist")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["detail"], "task not found");
}

#[tokio::test]
async fn test_negative_retention_is_rejected() {
    let (app, _dir) = setup_test_app().await;
    let response = app
        .oneshot(post("/api/tasks/cleanup", json!({"retention_days": -1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_retention_is_rejected_before_task_creation() {
    let (app, _dir) = setup_test_app().await;
    let response = app
        .oneshot(post("/api/tasks/cleanup", json!({"retention_days": 100_000_000})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let detail = json_body(response).await["detail"].as_str().unwrap().to_string();
    assert!(detail.contains("retention_days"));
}

#[tokio::test]
async fn test_unknown_backtest_is_404() {
    let (app, _dir) = setup_test_app().await;
    let response = app.oneshot(get("/api/backtests/by-task/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["detail"], "backtest not found");
}

// ============================================================================
// Schedules
// ============================================================================

#[tokio::test]
async fn test_schedule_create_list_delete() {
    let (app, _dir) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(post(
            "/api/schedules",
            json!({"job_id": "nightly", "cron": "0 2 * * *", "task_name": "orchestrator.cleanup"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["job_id"], "nightly");

    let response = app.clone().oneshot(get("/api/schedules")).await.unwrap();
    let listed = json_body(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/schedules/nightly")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(get("/health")).await.unwrap();
    let health = json_body(response).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["schedules"], 0);
}

#[tokio::test]
async fn test_malformed_cron_is_400() {
    let (app, _dir) = setup_test_app().await;
    let response = app
        .oneshot(post(
            "/api/schedules",
            json!({"job_id": "bad", "cron": "0 2 *", "task_name": "orchestrator.cleanup"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
