//! Integration tests for `src/web_api.rs`
//!
//! Each test binds a real server on an ephemeral port over a fresh
//! `ServingCore` and drives it with `reqwest`.
//!
//! All tests require the `web-api` Cargo feature.

#![cfg(feature = "web-api")]

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;

use tokio_prediction_orchestrator::config::{BackendConfig, BackendKind, RouteConfig, ServingConfig};
use tokio_prediction_orchestrator::ServingCore;

// ============================================================================
// Test Infrastructure
// ============================================================================

const KEY: &str = "test-key";

struct TestServer {
    base: String,
    core: Arc<ServingCore>,
    shutdown: watch::Sender<bool>,
}

fn config() -> ServingConfig {
    let mut config = ServingConfig::default();
    config.service.name = "api-test".into();
    config.service.api_keys = vec![KEY.into()];
    config.recovery.enabled = false;
    config.backends.push(BackendConfig {
        name: "a".into(),
        version: "v1".into(),
        kind: BackendKind::Static {
            value: 0.7,
            confidence: 0.9,
        },
    });
    config.routes.insert(
        "quality".into(),
        RouteConfig {
            members: vec!["a".into()],
            fallback: None,
            strategy: None,
        },
    );
    config
}

async fn spawn_server() -> TestServer {
    let core = Arc::new(ServingCore::from_config(config()).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let served = Arc::clone(&core);
    tokio::spawn(async move {
        let _ = tokio_prediction_orchestrator::web_api::serve(listener, served, rx).await;
    });
    TestServer {
        base: format!("http://{addr}"),
        core,
        shutdown,
    }
}

fn client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn predict(server: &TestServer, text: &str) -> Value {
    let resp = client()
        .post(format!("{}/api/v1/predict", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"model_id": "quality", "payload": {"text": text}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.unwrap()
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn test_predict_without_key_is_401() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/api/v1/predict", server.base))
        .json(&json!({"model_id": "quality", "payload": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client()
        .post(format!("{}/api/v1/predict", server.base))
        .header("x-api-key", "wrong")
        .json(&json!({"model_id": "quality", "payload": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.core.monitor.total_tracked(), 0);
}

#[tokio::test]
async fn test_body_key_is_accepted() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/api/v1/predict", server.base))
        .json(&json!({"model_id": "quality", "payload": "x", "api_key": KEY}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ============================================================================
// Serving
// ============================================================================

#[tokio::test]
async fn test_predict_returns_value_and_prediction_id() {
    let server = spawn_server().await;
    let body = predict(&server, "hello").await;
    assert!((body["value"].as_f64().unwrap() - 0.7).abs() < 1e-9);
    assert_eq!(body["source"], "model");
    assert!(!body["prediction_id"].as_str().unwrap().is_empty());

    let again = predict(&server, "hello").await;
    assert_eq!(again["source"], "cache");
    assert_ne!(again["prediction_id"], body["prediction_id"]);
}

#[tokio::test]
async fn test_unknown_model_is_404() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/api/v1/predict", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"model_id": "missing", "payload": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.core.monitor.total_tracked(), 1);
}

#[tokio::test]
async fn test_feedback_roundtrip_and_errors() {
    let server = spawn_server().await;
    let body = predict(&server, "rate me").await;
    let id = body["prediction_id"].as_str().unwrap().to_string();

    let resp = client()
        .post(format!("{}/api/v1/feedback", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"prediction_id": id, "feedback_type": "user", "payload": 4}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let receipt: Value = resp.json().await.unwrap();
    assert!((receipt["actual_value"].as_f64().unwrap() - 0.8).abs() < 1e-9);
    assert_eq!(receipt["created"], true);

    let resp = client()
        .post(format!("{}/api/v1/feedback", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"prediction_id": id, "feedback_type": "bot", "payload": "maybe"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = client()
        .post(format!("{}/api/v1/feedback", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"prediction_id": "nope", "feedback_type": "user", "payload": 4}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let stats: Value = client()
        .get(format!("{}/api/v1/feedback/stats?days=1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["status"], "available");
    assert_eq!(stats["data"]["with_outcome"], 1);
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_health_status_and_schema() {
    let server = spawn_server().await;

    let resp = client().get(format!("{}/health", server.base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let health: Value = resp.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "api-test");

    predict(&server, "status").await;
    let status: Value = client()
        .get(format!("{}/api/v1/status", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["service"], "api-test");
    assert_eq!(status["models"], json!(["quality"]));
    assert_eq!(status["deployments"]["a"]["active_version"], "v1");

    let schema: Value = client()
        .get(format!("{}/api/v1/schema", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(schema["openapi"], "3.0.0");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let server = spawn_server().await;
    let resp = client()
        .get(format!("{}/health", server.base))
        .header("x-request-id", "trace-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "trace-123");
}

#[tokio::test]
async fn test_rollback_without_rollout_is_409() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/api/v1/deployments/a/rollback", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"reason": "test"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let server = spawn_server().await;
    let payload = "x".repeat(2 * 1024 * 1024);
    let resp = client()
        .post(format!("{}/api/v1/predict", server.base))
        .header("x-api-key", KEY)
        .json(&json!({"model_id": "quality", "payload": payload}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let server = spawn_server().await;
    predict(&server, "before").await;
    server.shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = client().get(format!("{}/health", server.base)).send().await;
    assert!(result.is_err());
}
