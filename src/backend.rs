//! Model backend abstraction and implementations
//!
//! Provides the [`Predictor`] trait, the [`PredictorRegistry`] that the router
//! resolves backends through, and the shipped implementations:
//! - [`StaticPredictor`]: fixed answer with injectable delay/failure (testing/demo)
//! - [`FnPredictor`]: answer computed by a closure over the request
//! - [`HttpPredictor`]: JSON-over-HTTP scoring service
//!
//! Trained artifacts are loaded into predictors by the training module
//! (`training::trainer::CalibratedPredictor`).
//!
//! ## Environment Variables
//!
//! - Any variable named by `api_key_env` in a `kind = "http"` backend section
//!   is read as a bearer token for that backend.

use crate::{PredictionRequest, ServingError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Raw output of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    /// Predicted score, expected in `[0, 1]`.
    pub value: f64,
    /// Backend's self-reported confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl RawPrediction {
    /// Construct a prediction, clamping both fields into `[0, 1]`.
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Reject non-finite outputs and clamp the rest into range.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::BackendUnavailable`] if either field is NaN or infinite.
    pub fn sanitize(self, backend: &str) -> Result<Self, ServingError> {
        if !self.value.is_finite() || !self.confidence.is_finite() {
            return Err(ServingError::BackendUnavailable {
                backend: backend.to_string(),
                reason: format!(
                    "non-finite output (value={}, confidence={})",
                    self.value, self.confidence
                ),
            });
        }
        Ok(Self::new(self.value, self.confidence))
    }
}

/// Trait for scoring backends
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn Predictor>`.
/// The core never assumes more of a backend than this one call.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Score a request.
    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, ServingError>;
}

// ============================================================================
// Static Predictor (Testing)
// ============================================================================

/// Fixed-answer backend for tests and demos.
///
/// Failure and latency can be toggled at runtime so tests can drive the
/// circuit breaker and fallback paths without a real service.
pub struct StaticPredictor {
    name: String,
    prediction: RawPrediction,
    delay: Duration,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl StaticPredictor {
    /// Backend that always answers `value` with `confidence`.
    pub fn new(name: impl Into<String>, value: f64, confidence: f64) -> Self {
        Self {
            name: name.into(),
            prediction: RawPrediction::new(value, confidence),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulated inference delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of times `predict` has been invoked.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for StaticPredictor {
    async fn predict(&self, _request: &PredictionRequest) -> Result<RawPrediction, ServingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServingError::BackendUnavailable {
                backend: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(self.prediction)
    }
}

// ============================================================================
// Closure Predictor
// ============================================================================

/// Backend whose answer is computed from the request by a closure.
pub struct FnPredictor<F> {
    f: F,
}

impl<F> FnPredictor<F>
where
    F: Fn(&PredictionRequest) -> Result<RawPrediction, ServingError> + Send + Sync,
{
    /// Wrap a scoring closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Predictor for FnPredictor<F>
where
    F: Fn(&PredictionRequest) -> Result<RawPrediction, ServingError> + Send + Sync,
{
    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, ServingError> {
        (self.f)(request)
    }
}

// ============================================================================
// HTTP Predictor
// ============================================================================

/// Request body sent to a remote scoring service.
#[derive(Debug, Serialize)]
struct HttpScoreRequest<'a> {
    request_id: &'a str,
    prediction_type: &'a str,
    payload: &'a serde_json::Value,
}

/// JSON-over-HTTP scoring backend.
///
/// POSTs `{request_id, prediction_type, payload}` and expects
/// `{"value": f64, "confidence": f64?}` back. Missing confidence defaults to 1.0.
///
/// ## Example
///
/// ```no_run
/// use tokio_prediction_orchestrator::HttpPredictor;
/// use std::time::Duration;
///
/// let backend = HttpPredictor::new("scorer", "http://localhost:9000/score")
///     .with_timeout(Duration::from_secs(2));
/// ```
pub struct HttpPredictor {
    name: String,
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpPredictor {
    /// Create a backend that posts to `url`.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Send `Authorization: Bearer <key>` with every call.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn unavailable(&self, reason: String) -> ServingError {
        ServingError::BackendUnavailable {
            backend: self.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, ServingError> {
        let body = HttpScoreRequest {
            request_id: &request.id,
            prediction_type: &request.prediction_type,
            payload: &request.payload,
        };

        let mut call = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", format!("Bearer {key}"));
        }

        let response = call
            .send()
            .await
            .map_err(|e| self.unavailable(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("HTTP {status}: {error_text}")));
        }

        let raw: RawPrediction = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("failed to parse response: {e}")))?;

        raw.sanitize(&self.name)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Backends keyed by registry key.
///
/// New backend kinds are added by registering another `Arc<dyn Predictor>`;
/// nothing in the router branches on backend type.
#[derive(Default)]
pub struct PredictorRegistry {
    backends: DashMap<String, Arc<dyn Predictor>>,
}

impl PredictorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the backend stored under `key`.
    pub fn register(&self, key: impl Into<String>, predictor: Arc<dyn Predictor>) {
        let key = key.into();
        tracing::debug!(backend = %key, "backend registered");
        self.backends.insert(key, predictor);
    }

    /// Look up a backend.
    pub fn get(&self, key: &str) -> Option<Arc<dyn Predictor>> {
        self.backends.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a backend is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.backends.contains_key(key)
    }

    /// Remove and return a backend.
    pub fn remove(&self, key: &str) -> Option<Arc<dyn Predictor>> {
        self.backends.remove(key).map(|(_, p)| p)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
