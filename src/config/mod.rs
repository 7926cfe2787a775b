//! # Stage: Declarative Serving Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that declares backends, routes and the
//! tuning of every component:
//! ```text
//! prediction-orchestrator --config serving.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `ServingConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete defaults: every section may be omitted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building components from config (that belongs to `serving`)
//! - Hot reload (the routing table changes through `deployment` only)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::CacheSettings;
use crate::deployment::DeploymentSettings;
use crate::ensemble::{EnsembleSettings, EnsembleStrategy};
use crate::feedback::FeedbackSettings;
use crate::resilience::{BreakerSettings, RecoverySettings};
use crate::routing::RouterSettings;
use crate::training::TrainingSettings;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

/// Default service name.
fn default_service_name() -> String {
    "prediction-orchestrator".to_string()
}

/// Default HTTP bind address.
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Default version tag of a configured backend.
fn default_version() -> String {
    "v1".to_string()
}

/// Default self-reported confidence of a static backend.
fn default_confidence() -> f64 {
    0.8
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration of a serving instance.
///
/// # Example
///
/// ```toml
/// [service]
/// name = "quality-scoring"
///
/// [[backends]]
/// name = "heuristic"
/// kind = "static"
/// value = 0.6
///
/// [[backends]]
/// name = "scorer"
/// kind = "http"
/// url = "http://scorer.internal/predict"
///
/// [routes.quality]
/// members = ["heuristic", "scorer"]
/// fallback = "heuristic"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServingConfig {
    /// Service identity and inbound surface.
    #[serde(default)]
    pub service: ServiceSection,
    /// Model backends; each becomes a lineage serving version `version`.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Routable model ids.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
    /// Multi-tier cache.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Request routing.
    #[serde(default)]
    pub routing: RouterSettings,
    /// Ensemble combination and learning.
    #[serde(default)]
    pub ensemble: EnsembleSettings,
    /// Feedback capture.
    #[serde(default)]
    pub feedback: FeedbackSettings,
    /// Retraining pipeline.
    #[serde(default)]
    pub training: TrainingSettings,
    /// Rollout and drift policy.
    #[serde(default)]
    pub deployment: DeploymentSettings,
    /// Per-backend circuit breakers.
    #[serde(default)]
    pub resilience: BreakerSettings,
    /// Snapshots for disaster recovery.
    #[serde(default)]
    pub recovery: RecoverySettings,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ServingConfig {
    /// The configured backend called `name`.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

// ── Service ──────────────────────────────────────────────────────────────

/// Service identity and inbound surface.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServiceSection {
    /// Human-readable service name.
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Accepted API keys; empty disables the check.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// HTTP bind address (feature `web-api`).
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            api_keys: Vec::new(),
            bind: default_bind(),
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// One model backend.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendConfig {
    /// Lineage name, used in routes and as the ensemble member id.
    pub name: String,
    /// Version tag of the configured model.
    #[serde(default = "default_version")]
    pub version: String,
    /// How to reach it.
    #[serde(flatten)]
    pub kind: BackendKind,
}

impl BackendConfig {
    /// Registry key: `{name}@{version}`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Backend implementation.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Fixed answer (demos and smoke tests).
    Static {
        /// Predicted value in `[0, 1]`.
        value: f64,
        /// Confidence in `[0, 1]`.
        #[serde(default = "default_confidence")]
        confidence: f64,
    },
    /// JSON over HTTP.
    Http {
        /// Endpoint receiving the request as JSON.
        url: String,
        /// Bearer token, if required.
        api_key: Option<String>,
        /// Client timeout in milliseconds.
        timeout_ms: Option<u64>,
    },
}

// ── Routes ───────────────────────────────────────────────────────────────

/// How one model id is served.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouteConfig {
    /// Backend names combined for this model id.
    pub members: Vec<String>,
    /// Backend name answering when every member fails.
    pub fallback: Option<String>,
    /// Strategy override.
    pub strategy: Option<EnsembleStrategy>,
}

// ── Observability ────────────────────────────────────────────────────────

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// Structured JSON output.
    Json,
}

/// Logging and metrics configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log format; `LOG_FORMAT` in the environment takes precedence.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Register Prometheus metrics at startup.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: ServingConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServingConfig::default());
        assert_eq!(config.service.bind, "0.0.0.0:8080");
        assert_eq!(config.training.threshold, 50);
    }

    #[test]
    fn test_backend_kinds_parse() {
        let config: ServingConfig = toml::from_str(
            r#"
[[backends]]
name = "heuristic"
kind = "static"
value = 0.6

[[backends]]
name = "scorer"
version = "v3"
kind = "http"
url = "http://localhost:9000/predict"
timeout_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(
            config.backends[0].kind,
            BackendKind::Static {
                value: 0.6,
                confidence: 0.8
            }
        );
        assert_eq!(config.backends[0].key(), "heuristic@v1");
        assert_eq!(config.backend("scorer").map(BackendConfig::key).as_deref(), Some("scorer@v3"));
    }

    #[test]
    fn test_route_with_strategy_parses() {
        let config: ServingConfig = toml::from_str(
            r#"
[routes.quality]
members = ["a", "b"]
fallback = "a"
strategy = "confidence_weighted"
"#,
        )
        .unwrap();
        let route = &config.routes["quality"];
        assert_eq!(route.strategy, Some(EnsembleStrategy::ConfidenceWeighted));
        assert_eq!(route.fallback.as_deref(), Some("a"));
    }

    #[test]
    fn test_schema_exports() {
        let schema = schemars::schema_for!(ServingConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("backends"));
    }
}
