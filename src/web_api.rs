//! Web API Server
//!
//! HTTP surface of a [`ServingCore`].
//!
//! ## Endpoints
//!
//! ### Serving
//! - `POST /api/v1/predict` — Route a prediction request
//! - `POST /api/v1/feedback` — Submit an outcome for a recorded prediction
//!
//! ### Operations
//! - `GET  /api/v1/status` — Cache, breakers, deployments, pipelines, ensemble
//! - `GET  /api/v1/feedback/stats` — Feedback aggregates (`?service=&days=`)
//! - `GET  /api/v1/feedback/pending` — Predictions still waiting for an outcome
//! - `GET  /api/v1/feedback/health` — Last-24h feedback rate against its alert threshold
//! - `POST /api/v1/deployments/:lineage/rollback` — Restore the incumbent
//! - `POST /api/v1/training/:lineage/force` — Train now, below the threshold
//! - `POST /api/v1/recovery/snapshot` — Capture a recovery snapshot
//! - `GET  /api/v1/schema` — OpenAPI 3.0 schema
//! - `GET  /health` — Health check
//! - `GET  /metrics` — Prometheus metrics
//!
//! When `service.api_keys` is non-empty every `POST` requires a listed key,
//! sent as `x-api-key` or as an `api_key` body field.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ensemble::EnsembleStrategy;
use crate::feedback::{FeedbackError, FeedbackType};
use crate::serving::ServingCore;
use crate::training::TrainingError;
use crate::{PredictionRequest, PredictionSource, ServingError};

// ============================================================================
// Types
// ============================================================================

/// Maximum accepted request body (1 MiB).
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// JSON body for `POST /api/v1/predict`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictBody {
    /// Routed model id.
    pub model_id: String,
    /// Opaque input forwarded to backends.
    pub payload: serde_json::Value,
    /// Caller request id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Issuing service.
    #[serde(default)]
    pub service: Option<String>,
    /// Opt in to near-duplicate cache hits.
    #[serde(default)]
    pub semantic: bool,
    /// Strategy override.
    #[serde(default)]
    pub strategy: Option<EnsembleStrategy>,
    /// API key, as an alternative to the `x-api-key` header.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// JSON response of `POST /api/v1/predict`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    /// Predicted score.
    pub value: f64,
    /// Confidence.
    pub confidence: f64,
    /// Which path answered.
    pub source: PredictionSource,
    /// Id to send feedback against.
    pub prediction_id: String,
}

/// JSON body for `POST /api/v1/feedback`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackBody {
    /// Prediction the outcome refers to.
    pub prediction_id: String,
    /// Source of the outcome.
    pub feedback_type: FeedbackType,
    /// A bare score or a source-specific payload.
    pub payload: serde_json::Value,
    /// API key, as an alternative to the `x-api-key` header.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Query of the feedback read endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackQuery {
    /// Service filter.
    pub service: Option<String>,
    /// Window in days (stats only, default 7).
    pub days: Option<u32>,
    /// Maximum records (pending only, default 100).
    pub limit: Option<usize>,
    /// Alert threshold override (health only).
    pub threshold_pct: Option<f64>,
}

/// Optional body of the operational `POST` endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpsBody {
    /// Recorded reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// API key, as an alternative to the `x-api-key` header.
    #[serde(default)]
    pub api_key: Option<String>,
}

struct AppState {
    core: Arc<ServingCore>,
}

impl AppState {
    fn authorize(&self, headers: &HeaderMap, body_key: Option<&str>) -> Result<(), AppError> {
        let keys = &self.core.config.service.api_keys;
        if keys.is_empty() {
            return Ok(());
        }
        let presented = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or(body_key);
        match presented {
            Some(key) if keys.iter().any(|k| k == key) => Ok(()),
            _ => Err(AppError::Unauthorized),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Build the axum router over `core`.
pub fn router(core: Arc<ServingCore>) -> Router {
    let state = Arc::new(AppState { core });
    Router::new()
        .route("/api/v1/predict", post(predict_handler))
        .route("/api/v1/feedback", post(feedback_handler))
        .route("/api/v1/feedback/stats", get(feedback_stats_handler))
        .route("/api/v1/feedback/pending", get(feedback_pending_handler))
        .route("/api/v1/feedback/health", get(feedback_health_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/deployments/:lineage/rollback", post(rollback_handler))
        .route("/api/v1/training/:lineage/force", post(force_training_handler))
        .route("/api/v1/recovery/snapshot", post(snapshot_handler))
        .route("/api/v1/schema", get(schema_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            MAX_REQUEST_SIZE,
            body_size_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    core: Arc<ServingCore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("Web API ready on http://{}", addr);
    axum::serve(listener, router(core))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    info!("Web API stopped");
    Ok(())
}

/// Bind `service.bind` and serve until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    core: Arc<ServingCore>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = core.config.service.bind.clone();
    info!("Starting web API server on http://{}", addr);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, core, shutdown).await
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds a unique `X-Request-ID` header to every response.
///
/// If the client sends an `X-Request-ID` header, it is preserved; otherwise
/// a new UUID v4 is generated.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "Request body too large"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// Serving Handlers
// ============================================================================

/// `POST /api/v1/predict`
async fn predict_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PredictBody>,
) -> Result<Json<PredictResponse>, AppError> {
    state.authorize(&headers, body.api_key.as_deref())?;

    let mut request = PredictionRequest::new(body.payload).with_similarity(body.semantic);
    if let Some(id) = body.request_id {
        request = request.with_id(id);
    }
    if let Some(service) = body.service {
        request = request.with_service(service);
    }
    if let Some(strategy) = body.strategy {
        request = request.with_strategy(strategy);
    }

    let out = state.core.predict(&body.model_id, &request).await?;
    Ok(Json(PredictResponse {
        value: out.value,
        confidence: out.confidence,
        source: out.source,
        prediction_id: out.prediction_id,
    }))
}

/// `POST /api/v1/feedback`
async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FeedbackBody>,
) -> Result<Response, AppError> {
    state.authorize(&headers, body.api_key.as_deref())?;
    let receipt = state
        .core
        .feedback
        .submit_outcome(&body.prediction_id, body.feedback_type, body.payload)
        .await?;
    Ok(Json(receipt).into_response())
}

// ============================================================================
// Operational Handlers
// ============================================================================

/// `GET /api/v1/feedback/stats`
async fn feedback_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedbackQuery>,
) -> Response {
    let stats = state
        .core
        .feedback
        .get_feedback_stats(q.service.as_deref(), q.days.unwrap_or(7))
        .await;
    Json(stats).into_response()
}

/// `GET /api/v1/feedback/pending`
async fn feedback_pending_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedbackQuery>,
) -> Response {
    let pending = state
        .core
        .feedback
        .get_predictions_needing_feedback(q.service.as_deref(), q.limit.unwrap_or(100))
        .await;
    Json(pending).into_response()
}

/// `GET /api/v1/feedback/health`
async fn feedback_health_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedbackQuery>,
) -> Response {
    let health = state
        .core
        .feedback
        .monitor_feedback_collection(q.service.as_deref(), q.threshold_pct)
        .await;
    Json(health).into_response()
}

/// `GET /api/v1/status`
async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.core.status()).into_response()
}

/// `POST /api/v1/deployments/:lineage/rollback`
async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    Path(lineage): Path<String>,
    headers: HeaderMap,
    body: Option<Json<OpsBody>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    state.authorize(&headers, body.api_key.as_deref())?;
    let reason = body.reason.unwrap_or_else(|| "manual".to_string());
    let event = state
        .core
        .deployment
        .rollback(&lineage, &reason)
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    if let crate::deployment::DeploymentEvent::RolledBack { version, .. } = &event {
        state.core.pipeline.on_rollback(&lineage, version);
    }
    Ok(Json(event).into_response())
}

/// `POST /api/v1/training/:lineage/force`
async fn force_training_handler(
    State(state): State<Arc<AppState>>,
    Path(lineage): Path<String>,
    headers: HeaderMap,
    body: Option<Json<OpsBody>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    state.authorize(&headers, body.api_key.as_deref())?;
    let reason = body.reason.unwrap_or_else(|| "manual".to_string());
    let report = state.core.pipeline.force_training(&lineage, &reason).await?;
    Ok(Json(report).into_response())
}

/// `POST /api/v1/recovery/snapshot`
async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<OpsBody>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    state.authorize(&headers, body.api_key.as_deref())?;
    let reason = body.reason.unwrap_or_else(|| "manual".to_string());
    match state.core.recovery.snapshot(&reason).await {
        Ok(snapshot) => Ok(Json(serde_json::json!({
            "version": snapshot.version,
            "created_at": snapshot.created_at,
            "descriptors": snapshot.descriptors.len(),
        }))
        .into_response()),
        Err(e) => Err(AppError::Unavailable(e.to_string())),
    }
}

// ============================================================================
// Utility Handlers
// ============================================================================

/// `GET /health` — Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.core.config.service.name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /metrics` — Prometheus metrics endpoint.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// `GET /api/v1/schema` — Serve the OpenAPI 3.0 schema.
async fn schema_handler() -> (
    StatusCode,
    [(header::HeaderName, &'static str); 1],
    &'static str,
) {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        OPENAPI_SCHEMA,
    )
}

/// Static OpenAPI 3.0 document.
const OPENAPI_SCHEMA: &str = r##"{
  "openapi": "3.0.0",
  "info": {
    "title": "tokio-prediction-orchestrator",
    "version": "0.1.0",
    "description": "Prediction serving with ensembles, feedback capture and safe retraining"
  },
  "paths": {
    "/api/v1/predict": {
      "post": {
        "summary": "Route a prediction request",
        "requestBody": {
          "required": true,
          "content": {
            "application/json": {
              "schema": { "$ref": "#/components/schemas/PredictBody" }
            }
          }
        },
        "responses": {
          "200": { "description": "Prediction" },
          "401": { "description": "Missing or unknown API key" },
          "404": { "description": "Unknown model id" },
          "503": { "description": "No member or fallback answered" }
        }
      }
    },
    "/api/v1/feedback": {
      "post": {
        "summary": "Submit an outcome",
        "requestBody": {
          "required": true,
          "content": {
            "application/json": {
              "schema": { "$ref": "#/components/schemas/FeedbackBody" }
            }
          }
        },
        "responses": {
          "200": { "description": "Outcome recorded or queued" },
          "401": { "description": "Missing or unknown API key" },
          "404": { "description": "Unknown prediction" },
          "422": { "description": "Payload has no usable score" }
        }
      }
    },
    "/api/v1/feedback/stats": {
      "get": {
        "summary": "Feedback aggregates",
        "parameters": [
          { "name": "service", "in": "query", "schema": { "type": "string" } },
          { "name": "days", "in": "query", "schema": { "type": "integer", "default": 7 } }
        ],
        "responses": { "200": { "description": "Statistics or an outage marker" } }
      }
    },
    "/api/v1/feedback/pending": {
      "get": {
        "summary": "Predictions waiting for an outcome",
        "responses": { "200": { "description": "Prediction records" } }
      }
    },
    "/api/v1/feedback/health": {
      "get": {
        "summary": "Feedback rate against the alert threshold",
        "responses": { "200": { "description": "Feedback health" } }
      }
    },
    "/api/v1/status": {
      "get": {
        "summary": "Aggregate component status",
        "responses": { "200": { "description": "Status document" } }
      }
    },
    "/api/v1/deployments/{lineage}/rollback": {
      "post": {
        "summary": "Restore the incumbent of a lineage",
        "responses": {
          "200": { "description": "Rollback event" },
          "409": { "description": "Nothing to roll back" }
        }
      }
    },
    "/api/v1/training/{lineage}/force": {
      "post": {
        "summary": "Train a lineage now",
        "responses": {
          "200": { "description": "Training report" },
          "409": { "description": "Not enough data or already training" }
        }
      }
    },
    "/api/v1/recovery/snapshot": {
      "post": {
        "summary": "Capture a recovery snapshot",
        "responses": { "200": { "description": "Snapshot summary" } }
      }
    },
    "/api/v1/schema": {
      "get": {
        "summary": "OpenAPI 3.0 schema",
        "responses": { "200": { "description": "This schema document" } }
      }
    },
    "/health": {
      "get": {
        "summary": "Health check",
        "responses": { "200": { "description": "Service healthy" } }
      }
    },
    "/metrics": {
      "get": {
        "summary": "Prometheus metrics",
        "responses": { "200": { "description": "Prometheus text format metrics" } }
      }
    }
  },
  "components": {
    "schemas": {
      "PredictBody": {
        "type": "object",
        "required": ["model_id", "payload"],
        "properties": {
          "model_id": { "type": "string" },
          "payload": {},
          "request_id": { "type": "string" },
          "service": { "type": "string" },
          "semantic": { "type": "boolean", "default": false },
          "strategy": { "type": "string", "enum": ["simple_average", "confidence_weighted", "dynamic_selection", "stacking"] },
          "api_key": { "type": "string" }
        }
      },
      "FeedbackBody": {
        "type": "object",
        "required": ["prediction_id", "feedback_type", "payload"],
        "properties": {
          "prediction_id": { "type": "string" },
          "feedback_type": { "type": "string", "enum": ["user", "bot", "ai-system", "survey", "comment"] },
          "payload": {},
          "api_key": { "type": "string" }
        }
      }
    }
  }
}"##;

// ============================================================================
// Error Type
// ============================================================================

/// Application-level errors returned by API handlers.
///
/// Each variant maps to an HTTP status code and a JSON error body.
#[derive(Debug)]
enum AppError {
    /// Missing or unknown API key.
    Unauthorized,
    /// The referenced model, prediction or lineage does not exist.
    NotFound(String),
    /// The request is well-formed but unusable.
    Unprocessable(String),
    /// The operation conflicts with the current state.
    Conflict(String),
    /// A dependency could not answer.
    Unavailable(String),
    /// Anything else.
    Internal(String),
}

impl From<ServingError> for AppError {
    fn from(e: ServingError) -> Self {
        match e {
            ServingError::InvalidModel(_) => AppError::NotFound(e.to_string()),
            ServingError::NoPrediction { .. }
            | ServingError::BackendUnavailable { .. }
            | ServingError::CircuitOpen(_) => AppError::Unavailable(e.to_string()),
            ServingError::ConfigError(_) | ServingError::Other(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<FeedbackError> for AppError {
    fn from(e: FeedbackError) -> Self {
        match e {
            FeedbackError::UnknownPrediction(_) => AppError::NotFound(e.to_string()),
            FeedbackError::InvalidScore(_) | FeedbackError::Unnormalizable { .. } => {
                AppError::Unprocessable(e.to_string())
            }
            FeedbackError::PersistenceUnavailable(_) => AppError::Unavailable(e.to_string()),
        }
    }
}

impl From<TrainingError> for AppError {
    fn from(e: TrainingError) -> Self {
        match e {
            TrainingError::UnknownLineage(_) => AppError::NotFound(e.to_string()),
            TrainingError::InsufficientData { .. }
            | TrainingError::NotReady { .. }
            | TrainingError::AlreadyTraining(_)
            | TrainingError::Deployment(_) => AppError::Conflict(e.to_string()),
            TrainingError::Trainer(_) | TrainingError::Artifact(_) | TrainingError::Export(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid or missing API key".to_string()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m),
            AppError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            AppError::Internal(m) => {
                warn!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_schema_is_valid_json() {
        let parsed: serde_json::Value =
            serde_json::from_str(OPENAPI_SCHEMA).expect("OPENAPI_SCHEMA must be valid JSON");
        assert_eq!(parsed["openapi"], "3.0.0");
    }

    #[test]
    fn test_openapi_schema_contains_all_endpoints() {
        let parsed: serde_json::Value = serde_json::from_str(OPENAPI_SCHEMA).expect("valid JSON");
        let paths = parsed["paths"].as_object().expect("paths is object");
        for path in [
            "/api/v1/predict",
            "/api/v1/feedback",
            "/api/v1/feedback/stats",
            "/api/v1/status",
            "/health",
            "/metrics",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn test_predict_body_minimal_deserializes() {
        let body: PredictBody =
            serde_json::from_str(r#"{"model_id": "quality", "payload": {"x": 1}}"#).expect("deser");
        assert_eq!(body.model_id, "quality");
        assert!(!body.semantic);
        assert!(body.strategy.is_none());
        assert!(body.api_key.is_none());
    }

    #[test]
    fn test_feedback_body_uses_kebab_case_types() {
        let body: FeedbackBody = serde_json::from_str(
            r#"{"prediction_id": "p1", "feedback_type": "ai-system", "payload": 0.7}"#,
        )
        .expect("deser");
        assert_eq!(body.feedback_type, FeedbackType::AiSystem);
    }

    #[test]
    fn test_serving_errors_map_to_status_codes() {
        let status = |e: ServingError| AppError::from(e).into_response().status();
        assert_eq!(status(ServingError::InvalidModel("m".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(ServingError::NoPrediction {
                model_id: "m".into(),
                reason: "down".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_feedback_errors_map_to_status_codes() {
        let status = |e: FeedbackError| AppError::from(e).into_response().status();
        assert_eq!(
            status(FeedbackError::UnknownPrediction("p".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(FeedbackError::InvalidScore(3.0)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
