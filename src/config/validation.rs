//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`ServingConfig`] that cannot
//! be expressed through the type system alone (range checks, references
//! between routes and backends).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;
use std::net::SocketAddr;

use super::{BackendKind, ServingConfig};

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "training.holdout_pct").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn unit_interval(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

/// Validate all semantic constraints on a [`ServingConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &ServingConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Service ──────────────────────────────────────────────────────
    if config.service.name.trim().is_empty() {
        errors.push(invalid("service.name", "\"\"", "must not be empty"));
    }
    if config.service.bind.parse::<SocketAddr>().is_err() {
        errors.push(invalid(
            "service.bind",
            &config.service.bind,
            "must be a socket address such as 0.0.0.0:8080",
        ));
    }

    // ── Backends ─────────────────────────────────────────────────────
    let mut names = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        let path = format!("backends[{i}]");
        if backend.name.trim().is_empty() {
            errors.push(invalid(format!("{path}.name"), "\"\"", "must not be empty"));
        } else if backend.name.contains('@') {
            errors.push(invalid(format!("{path}.name"), &backend.name, "must not contain '@'"));
        } else if !names.insert(backend.name.as_str()) {
            errors.push(invalid(format!("{path}.name"), &backend.name, "duplicate backend name"));
        }
        if backend.version.trim().is_empty() {
            errors.push(invalid(format!("{path}.version"), "\"\"", "must not be empty"));
        }
        match &backend.kind {
            BackendKind::Static { value, confidence } => {
                if !unit_interval(*value) {
                    errors.push(invalid(format!("{path}.value"), value, "must be between 0.0 and 1.0"));
                }
                if !unit_interval(*confidence) {
                    errors.push(invalid(
                        format!("{path}.confidence"),
                        confidence,
                        "must be between 0.0 and 1.0",
                    ));
                }
            }
            BackendKind::Http { url, timeout_ms, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(invalid(format!("{path}.url"), url, "must be an http(s) URL"));
                }
                if *timeout_ms == Some(0) {
                    errors.push(invalid(format!("{path}.timeout_ms"), 0, "must be at least 1"));
                }
            }
        }
    }

    // ── Routes ───────────────────────────────────────────────────────
    for (model_id, route) in &config.routes {
        let path = format!("routes.{model_id}");
        if route.members.is_empty() {
            errors.push(invalid(format!("{path}.members"), "[]", "must name at least one backend"));
        }
        for member in &route.members {
            if !names.contains(member.as_str()) {
                errors.push(invalid(format!("{path}.members"), member, "unknown backend"));
            }
        }
        if let Some(fallback) = &route.fallback {
            if !names.contains(fallback.as_str()) {
                errors.push(invalid(format!("{path}.fallback"), fallback, "unknown backend"));
            }
        }
    }

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.fast_capacity == 0 {
        errors.push(invalid("cache.fast_capacity", 0, "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&config.cache.similarity_threshold) {
        errors.push(invalid(
            "cache.similarity_threshold",
            config.cache.similarity_threshold,
            "must be between 0.0 and 1.0",
        ));
    }
    if config.cache.fingerprint_dim == 0 {
        errors.push(invalid("cache.fingerprint_dim", 0, "must be at least 1"));
    }

    // ── Routing ──────────────────────────────────────────────────────
    if config.routing.retry_attempts == 0 {
        errors.push(invalid("routing.retry_attempts", 0, "must be at least 1"));
    }
    if config.routing.member_timeout_ms == 0 {
        errors.push(invalid("routing.member_timeout_ms", 0, "must be at least 1"));
    }

    // ── Ensemble ─────────────────────────────────────────────────────
    if !(0.0..1.0).contains(&config.ensemble.decay) {
        errors.push(invalid("ensemble.decay", config.ensemble.decay, "must be in [0.0, 1.0)"));
    }
    if config.ensemble.learning_rate <= 0.0 {
        errors.push(invalid(
            "ensemble.learning_rate",
            config.ensemble.learning_rate,
            "must be positive",
        ));
    }
    if !unit_interval(config.ensemble.selection_threshold) {
        errors.push(invalid(
            "ensemble.selection_threshold",
            config.ensemble.selection_threshold,
            "must be between 0.0 and 1.0",
        ));
    }

    // ── Feedback ─────────────────────────────────────────────────────
    if config.feedback.queue_capacity == 0 {
        errors.push(invalid("feedback.queue_capacity", 0, "must be at least 1"));
    }
    if config.feedback.batch_size == 0 {
        errors.push(invalid("feedback.batch_size", 0, "must be at least 1"));
    }
    if config.feedback.flush_interval_ms == 0 {
        errors.push(invalid("feedback.flush_interval_ms", 0, "must be at least 1"));
    }

    // ── Training ─────────────────────────────────────────────────────
    if config.training.threshold == 0 {
        errors.push(invalid("training.threshold", 0, "must be at least 1"));
    }
    if !(1..=50).contains(&config.training.holdout_pct) {
        errors.push(invalid(
            "training.holdout_pct",
            config.training.holdout_pct,
            "must be between 1 and 50",
        ));
    }
    if config.training.max_examples < config.training.threshold {
        errors.push(invalid(
            "training.max_examples",
            config.training.max_examples,
            "must be \u{2265} training.threshold",
        ));
    }

    // ── Deployment ───────────────────────────────────────────────────
    if !(1..=100).contains(&config.deployment.canary_traffic_pct) {
        errors.push(invalid(
            "deployment.canary_traffic_pct",
            config.deployment.canary_traffic_pct,
            "must be between 1 and 100",
        ));
    }
    if !unit_interval(config.deployment.min_accuracy) {
        errors.push(invalid(
            "deployment.min_accuracy",
            config.deployment.min_accuracy,
            "must be between 0.0 and 1.0",
        ));
    }
    for (field, v) in [
        ("deployment.accuracy_tolerance", config.deployment.accuracy_tolerance),
        ("deployment.regression_tolerance", config.deployment.regression_tolerance),
        ("deployment.promotion_tolerance", config.deployment.promotion_tolerance),
        ("deployment.rollback_tolerance", config.deployment.rollback_tolerance),
        ("deployment.drift.tolerance", config.deployment.drift.tolerance),
    ] {
        if v < 0.0 {
            errors.push(invalid(field, v, "must not be negative"));
        }
    }
    if config.deployment.min_live_samples == 0 {
        errors.push(invalid("deployment.min_live_samples", 0, "must be at least 1"));
    }

    // ── Circuit breaker ──────────────────────────────────────────────
    if config.resilience.failure_threshold == 0 {
        errors.push(invalid("resilience.failure_threshold", 0, "must be at least 1"));
    }
    if config.resilience.failure_rate_threshold <= 0.0
        || config.resilience.failure_rate_threshold > 1.0
    {
        errors.push(invalid(
            "resilience.failure_rate_threshold",
            config.resilience.failure_rate_threshold,
            "must be in (0.0, 1.0]",
        ));
    }
    if config.resilience.window_size == 0 {
        errors.push(invalid("resilience.window_size", 0, "must be at least 1"));
    }

    // ── Recovery ─────────────────────────────────────────────────────
    if config.recovery.enabled && config.recovery.interval_secs == 0 {
        errors.push(invalid("recovery.interval_secs", 0, "must be at least 1 when enabled"));
    }
    if config.recovery.max_snapshots == 0 {
        errors.push(invalid("recovery.max_snapshots", 0, "must be at least 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, RouteConfig};

    fn static_backend(name: &str, value: f64) -> BackendConfig {
        BackendConfig {
            name: name.into(),
            version: "v1".into(),
            kind: BackendKind::Static {
                value,
                confidence: 0.8,
            },
        }
    }

    fn valid_config() -> ServingConfig {
        let mut config = ServingConfig::default();
        config.backends = vec![static_backend("a", 0.4), static_backend("b", 0.6)];
        config.routes.insert(
            "quality".into(),
            RouteConfig {
                members: vec!["a".into(), "b".into()],
                fallback: Some("a".into()),
                strategy: None,
            },
        );
        config
    }

    fn fields(config: &ServingConfig) -> Vec<String> {
        match validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .filter_map(|e| match e {
                    ConfigError::InvalidField { field, .. } => Some(field),
                    _ => None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_default_config_passes() {
        assert!(validate(&ServingConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_empty_service_name_fails() {
        let mut config = valid_config();
        config.service.name = " ".into();
        assert_eq!(fields(&config), vec!["service.name"]);
    }

    #[test]
    fn test_validate_bad_bind_fails() {
        let mut config = valid_config();
        config.service.bind = "localhost".into();
        assert_eq!(fields(&config), vec!["service.bind"]);
    }

    #[test]
    fn test_validate_duplicate_backend_fails() {
        let mut config = valid_config();
        config.backends.push(static_backend("a", 0.1));
        assert_eq!(fields(&config), vec!["backends[2].name"]);
    }

    #[test]
    fn test_validate_backend_name_with_at_fails() {
        let mut config = ServingConfig::default();
        config.backends.push(static_backend("a@v2", 0.1));
        assert_eq!(fields(&config), vec!["backends[0].name"]);
    }

    #[test]
    fn test_validate_static_value_out_of_range_fails() {
        let mut config = valid_config();
        config.backends[1] = static_backend("b", 1.5);
        assert_eq!(fields(&config), vec!["backends[1].value"]);
    }

    #[test]
    fn test_validate_http_url_scheme_fails() {
        let mut config = ServingConfig::default();
        config.backends.push(BackendConfig {
            name: "remote".into(),
            version: "v1".into(),
            kind: BackendKind::Http {
                url: "ftp://host/predict".into(),
                api_key: None,
                timeout_ms: Some(0),
            },
        });
        assert_eq!(
            fields(&config),
            vec!["backends[0].url", "backends[0].timeout_ms"]
        );
    }

    #[test]
    fn test_validate_route_unknown_member_fails() {
        let mut config = valid_config();
        config.routes.insert(
            "other".into(),
            RouteConfig {
                members: vec!["missing".into()],
                fallback: Some("ghost".into()),
                strategy: None,
            },
        );
        assert_eq!(
            fields(&config),
            vec!["routes.other.members", "routes.other.fallback"]
        );
    }

    #[test]
    fn test_validate_route_without_members_fails() {
        let mut config = valid_config();
        config.routes.insert(
            "empty".into(),
            RouteConfig {
                members: Vec::new(),
                fallback: None,
                strategy: None,
            },
        );
        assert_eq!(fields(&config), vec!["routes.empty.members"]);
    }

    #[test]
    fn test_validate_cache_capacity_zero_fails() {
        let mut config = valid_config();
        config.cache.fast_capacity = 0;
        assert_eq!(fields(&config), vec!["cache.fast_capacity"]);
    }

    #[test]
    fn test_validate_similarity_threshold_above_one_fails() {
        let mut config = valid_config();
        config.cache.similarity_threshold = 1.2;
        assert_eq!(fields(&config), vec!["cache.similarity_threshold"]);
    }

    #[test]
    fn test_validate_routing_zero_attempts_fails() {
        let mut config = valid_config();
        config.routing.retry_attempts = 0;
        config.routing.member_timeout_ms = 0;
        assert_eq!(
            fields(&config),
            vec!["routing.retry_attempts", "routing.member_timeout_ms"]
        );
    }

    #[test]
    fn test_validate_ensemble_decay_one_fails() {
        let mut config = valid_config();
        config.ensemble.decay = 1.0;
        assert_eq!(fields(&config), vec!["ensemble.decay"]);
    }

    #[test]
    fn test_validate_ensemble_decay_zero_passes() {
        let mut config = valid_config();
        config.ensemble.decay = 0.0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_feedback_batch_zero_fails() {
        let mut config = valid_config();
        config.feedback.batch_size = 0;
        assert_eq!(fields(&config), vec!["feedback.batch_size"]);
    }

    #[test]
    fn test_validate_training_threshold_zero_fails() {
        let mut config = valid_config();
        config.training.threshold = 0;
        assert_eq!(fields(&config), vec!["training.threshold"]);
    }

    #[test]
    fn test_validate_holdout_bounds() {
        let mut config = valid_config();
        config.training.holdout_pct = 0;
        assert_eq!(fields(&config), vec!["training.holdout_pct"]);
        config.training.holdout_pct = 51;
        assert_eq!(fields(&config), vec!["training.holdout_pct"]);
        config.training.holdout_pct = 50;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_max_examples_below_threshold_fails() {
        let mut config = valid_config();
        config.training.max_examples = 10;
        assert_eq!(fields(&config), vec!["training.max_examples"]);
    }

    #[test]
    fn test_validate_canary_pct_zero_fails() {
        let mut config = valid_config();
        config.deployment.canary_traffic_pct = 0;
        assert_eq!(fields(&config), vec!["deployment.canary_traffic_pct"]);
    }

    #[test]
    fn test_validate_canary_pct_hundred_passes() {
        let mut config = valid_config();
        config.deployment.canary_traffic_pct = 100;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_negative_tolerance_fails() {
        let mut config = valid_config();
        config.deployment.rollback_tolerance = -0.1;
        assert_eq!(fields(&config), vec!["deployment.rollback_tolerance"]);
    }

    #[test]
    fn test_validate_breaker_threshold_zero_fails() {
        let mut config = valid_config();
        config.resilience.failure_threshold = 0;
        assert_eq!(fields(&config), vec!["resilience.failure_threshold"]);
    }

    #[test]
    fn test_validate_breaker_rate_zero_fails() {
        let mut config = valid_config();
        config.resilience.failure_rate_threshold = 0.0;
        assert_eq!(fields(&config), vec!["resilience.failure_rate_threshold"]);
    }

    #[test]
    fn test_validate_recovery_interval_zero_fails_only_when_enabled() {
        let mut config = valid_config();
        config.recovery.interval_secs = 0;
        assert_eq!(fields(&config), vec!["recovery.interval_secs"]);
        config.recovery.enabled = false;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let mut config = valid_config();
        config.training.threshold = 0;
        config.cache.fast_capacity = 0;
        config.resilience.failure_threshold = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_config_error_invalid_field_display() {
        let err = ConfigError::InvalidField {
            field: "training.holdout_pct".into(),
            value: "0".into(),
            reason: "must be between 1 and 50".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("training.holdout_pct"));
        assert!(msg.contains("must be between 1 and 50"));
    }

    #[test]
    fn test_config_error_validation_display() {
        let err = ConfigError::Validation("bad things".into());
        assert!(err.to_string().contains("bad things"));
    }

    #[test]
    fn test_config_error_io_display() {
        let err = ConfigError::Io {
            file: "serving.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("serving.toml"));
    }
}
