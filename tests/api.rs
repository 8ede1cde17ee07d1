//! HTTP surface tests via `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use common::{chain_topology, scheduler_with, MockControlPlane};
use meshtest::api::{self, state::AppState};
use meshtest::scheduler::Scheduler;

fn app() -> (TempDir, Scheduler, Router) {
    let cp = Arc::new(MockControlPlane::new(&["net1"]).with_topology(chain_topology("net1")));
    let (dir, scheduler) = scheduler_with(cp);
    let router = api::router(AppState::new(scheduler.clone()));
    (dir, scheduler, router)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (_dir, _scheduler, router) = app();
    let (status, body) = send(&router, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["meta"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (_dir, _scheduler, router) = app();
    let (status, _) = send(&router, Method::GET, "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_schedule_crud() {
    let (_dir, scheduler, router) = app();

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({
            "cron_expr": "0 3 * * *",
            "network_name": "net1",
            "test_type": "parallel_link",
            "options": { "timeSec": 120 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["enabled"], true);
    assert_eq!(body["data"]["definition"]["test_type"], "PARALLEL_LINK");
    assert_eq!(body["data"]["definition"]["options"]["timeSec"], 120);
    assert!(scheduler.has_schedule(id).await);

    let (status, body) = send(&router, Method::GET, "/api/v1/schedules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);

    let (status, body) = send(
        &router,
        Method::PUT,
        &format!("/api/v1/schedules/{}", id),
        Some(json!({
            "enabled": false,
            "cron_expr": "30 3 * * *",
            "network_name": "net1",
            "test_type": "MULTIHOP"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cron_expr"], "30 3 * * *");
    assert_eq!(body["data"]["enabled"], false);

    let (status, body) = send(&router, Method::GET, "/api/v1/schedules/dry-run?hours=48", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 0);

    let (status, _) = send(&router, Method::DELETE, &format!("/api/v1/schedules/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&router, Method::GET, &format!("/api/v1/schedules/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::DELETE, &format!("/api/v1/schedules/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_schedule_validation_errors() {
    let (_dir, _scheduler, router) = app();

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({ "cron_expr": "sometimes", "network_name": "net1", "test_type": "MULTIHOP" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({ "cron_expr": "0 * * * *", "network_name": "net1", "test_type": "PING" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({ "cron_expr": "0 * * * *", "network_name": " ", "test_type": "MULTIHOP" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_execution_lifecycle() {
    let (_dir, _scheduler, router) = app();
    let request = json!({
        "network_name": "net1",
        "test_type": "PARALLEL_LINK",
        "options": { "timeSec": 60 }
    });

    let (status, body) = send(&router, Method::POST, "/api/v1/executions", Some(request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "RUNNING");
    let id = body["data"]["id"].as_i64().unwrap();

    let (status, _) = send(&router, Method::POST, "/api/v1/executions", Some(request)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&router, Method::GET, &format!("/api/v1/executions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["active"], true);

    let (status, body) = send(&router, Method::GET, "/api/v1/executions?status=running", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);

    let (status, body) = send(&router, Method::DELETE, &format!("/api/v1/executions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["stopped"], true);
    assert_ne!(body["data"]["status"], "RUNNING");

    let (status, body) = send(&router, Method::DELETE, &format!("/api/v1/executions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["stopped"], false);

    let (status, body) = send(&router, Method::GET, &format!("/api/v1/executions/{}/results", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn test_execution_errors() {
    let (_dir, _scheduler, router) = app();

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "network_name": "elsewhere", "test_type": "PARALLEL_NODE" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "network_name": "net1", "test_type": "MULTIHOP", "options": { "timeSec": 0 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("timeSec"));

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/v1/schedules",
        Some(json!({
            "cron_expr": "0 0 * * 0",
            "network_name": "net1",
            "test_type": "SEQUENTIAL_LINK",
            "options": { "timeSec": 9223372036854775807u64 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, Method::GET, "/api/v1/executions/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::DELETE, "/api/v1/executions/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::GET, "/api/v1/executions/42/results", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::GET, "/api/v1/executions?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
