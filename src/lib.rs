//! # tokio-prediction-orchestrator
//!
//! Serving and continuous-improvement core for score-predicting models over Tokio.
//!
//! ## Architecture
//!
//! ```text
//!               ┌──────────────── MultiTierCache (memory → redis → disk)
//! request → RequestRouter ── members (breaker → retry → timeout) ── EnsemblePredictor
//!               │                                                     │
//!               └── track_request (exactly once)        FeedbackCollector (queue + flusher)
//!                                                                     │ outcome
//!                           DeploymentManager ◄── TrainingPipeline ◄── LearningLoop
//!                                  │
//!                         RoutingTable swap (atomic)
//! ```
//!
//! Every stateful component is an injectable instance; [`serving::ServingCore`]
//! wires one of each from a [`config::ServingConfig`].

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod cache;
pub mod config;
pub mod deployment;
pub mod ensemble;
pub mod feedback;
pub mod learning;
pub mod metrics;
pub mod resilience;
pub mod routing;
pub mod serving;
pub mod training;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use backend::{HttpPredictor, Predictor, PredictorRegistry, RawPrediction, StaticPredictor};
pub use cache::MultiTierCache;
pub use ensemble::{EnsemblePredictor, EnsembleStrategy, MemberPrediction};
pub use feedback::{FeedbackCollector, FeedbackType, ReadResult};
pub use routing::RequestRouter;
pub use serving::ServingCore;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`ServingError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), ServingError> {
    init_tracing_with(config::LogFormat::Pretty)
}

/// Like [`init_tracing`], with `default` used when `LOG_FORMAT` is unset.
///
/// # Errors
///
/// As [`init_tracing`].
pub fn init_tracing_with(default: config::LogFormat) -> Result<(), ServingError> {
    let json = match std::env::var("LOG_FORMAT") {
        Ok(format) => format == "json",
        Err(_) => default == config::LogFormat::Json,
    };

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init()
    };

    result.map_err(|e| ServingError::Other(format!("tracing init failed: {e}")))
}

/// Errors visible on the serving path.
///
/// Learning and monitoring failures never surface here; they are logged and
/// exposed through the operational surface instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServingError {
    /// The requested model id is not present in the routing table.
    #[error("unknown model: {0}")]
    InvalidModel(String),

    /// A backend timed out, was unreachable, or returned an unusable answer.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        /// Registry key of the backend.
        backend: String,
        /// Human-readable failure description.
        reason: String,
    },

    /// The backend's circuit breaker is open; the call was not attempted.
    #[error("circuit open for backend '{0}'")]
    CircuitOpen(String),

    /// Every ensemble member failed and no fallback could answer.
    #[error("no prediction available for model '{model_id}': {reason}")]
    NoPrediction {
        /// The routed model id.
        model_id: String,
        /// Summary of the member failures.
        reason: String,
    },

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than on the first request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// A prediction request as seen by the router and by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRequest {
    /// Caller-supplied or generated request id; also drives traffic splitting.
    pub id: String,
    /// Opaque input forwarded to backends.
    pub payload: serde_json::Value,
    /// Logical service that issued the request (used for feedback statistics).
    #[serde(default = "default_service")]
    pub service: String,
    /// Kind of score being predicted (e.g. `"quality"`).
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
    /// Opt in to near-duplicate cache lookups on an exact miss.
    #[serde(default)]
    pub allow_similar: bool,
    /// Override the route's ensemble strategy for this request.
    #[serde(default)]
    pub strategy: Option<EnsembleStrategy>,
}

fn default_service() -> String {
    "default".to_string()
}

fn default_prediction_type() -> String {
    "quality".to_string()
}

impl PredictionRequest {
    /// Build a request with a fresh UUID and default service metadata.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            service: default_service(),
            prediction_type: default_prediction_type(),
            allow_similar: false,
            strategy: None,
        }
    }

    /// Replace the request id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the issuing service name.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Enable or disable the semantic cache lookup.
    pub fn with_similarity(mut self, allow: bool) -> Self {
        self.allow_similar = allow;
        self
    }

    /// Force a specific ensemble strategy.
    pub fn with_strategy(mut self, strategy: EnsembleStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Text used for fingerprinting and cache keys.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Where a routed prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    /// Exact cache hit.
    Cache,
    /// Near-duplicate cache hit.
    SimilarCache,
    /// A single routed member answered.
    Model,
    /// Several members answered and were combined.
    Ensemble,
    /// All members failed; the route's fallback backend answered.
    Fallback,
}

impl PredictionSource {
    /// `true` for both exact and near-duplicate cache hits.
    pub fn is_cache(&self) -> bool {
        matches!(self, PredictionSource::Cache | PredictionSource::SimilarCache)
    }

    /// Stable label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::Cache => "cache",
            PredictionSource::SimilarCache => "similar_cache",
            PredictionSource::Model => "model",
            PredictionSource::Ensemble => "ensemble",
            PredictionSource::Fallback => "fallback",
        }
    }
}

/// The answer returned to callers of [`RequestRouter::route`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutedPrediction {
    /// Predicted score in `[0, 1]`.
    pub value: f64,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Which path produced the answer.
    pub source: PredictionSource,
    /// Id under which the prediction was recorded for later feedback.
    pub prediction_id: String,
    /// Per-member raw predictions that fed the answer.
    #[serde(default)]
    pub members: Vec<MemberPrediction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder_defaults() {
        let req = PredictionRequest::new(json!({"text": "hello"}));
        assert_eq!(req.service, "default");
        assert_eq!(req.prediction_type, "quality");
        assert!(!req.allow_similar);
        assert!(req.strategy.is_none());
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_payload_text_unwraps_strings() {
        let req = PredictionRequest::new(json!("plain text"));
        assert_eq!(req.payload_text(), "plain text");
        let req = PredictionRequest::new(json!({"a": 1}));
        assert_eq!(req.payload_text(), r#"{"a":1}"#);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: PredictionRequest =
            serde_json::from_value(json!({"id": "r1", "payload": {"x": 1}})).unwrap();
        assert_eq!(req.id, "r1");
        assert_eq!(req.service, "default");
    }

    #[test]
    fn test_source_cache_classification() {
        assert!(PredictionSource::Cache.is_cache());
        assert!(PredictionSource::SimilarCache.is_cache());
        assert!(!PredictionSource::Fallback.is_cache());
        assert_eq!(PredictionSource::SimilarCache.as_str(), "similar_cache");
    }

    #[test]
    fn test_serving_error_display() {
        let e = ServingError::InvalidModel("nope".into());
        assert_eq!(e.to_string(), "unknown model: nope");
        let e = ServingError::CircuitOpen("b1".into());
        assert!(e.to_string().contains("b1"));
    }
}
