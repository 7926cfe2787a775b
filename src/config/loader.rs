//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`ServingConfig`], and run
//! validation before returning. This is the primary entry point for loading
//! serving configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Building components (that belongs to `serving`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::ServingConfig;

/// Load a [`ServingConfig`] from a TOML file.
///
/// Reads the file, parses it as TOML, and validates all semantic constraints.
///
/// # Arguments
///
/// * `path` — Path to the TOML configuration file.
///
/// # Returns
///
/// - `Ok(ServingConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_prediction_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("serving.toml"))?;
/// println!("Loaded service: {}", config.service.name);
/// ```
pub fn load_from_file(path: &Path) -> Result<ServingConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`ServingConfig`] from a TOML string.
///
/// Useful for testing or embedding configs without file I/O.
///
/// # Arguments
///
/// * `content` — TOML content as a string.
/// * `source_name` — Identifier for the source (used in error messages).
///
/// # Returns
///
/// - `Ok(ServingConfig)` if the TOML is well-formed and valid.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<ServingConfig, ConfigError> {
    let config: ServingConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[service]
name = "test"
api_keys = ["k1"]

[[backends]]
name = "heuristic"
kind = "static"
value = 0.5

[[backends]]
name = "scorer"
version = "v2"
kind = "http"
url = "http://127.0.0.1:9000/predict"

[routes.quality]
members = ["heuristic", "scorer"]
fallback = "heuristic"

[training]
threshold = 20
holdout_pct = 25

[observability]
log_format = "json"
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test").expect("test: valid config");
        assert_eq!(config.service.name, "test");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.training.threshold, 20);
        assert_eq!(config.observability.log_format, super::super::LogFormat::Json);
    }

    #[test]
    fn test_shipped_example_config_loads() {
        let config = load_from_str(
            include_str!("../../config/serving.example.toml"),
            "serving.example.toml",
        )
        .expect("test: example config");
        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.routes["quality"].members.len(), 2);
        assert_eq!(config.backend("scorer").map(|b| b.key()), Some("scorer@v1".to_string()));
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let result = load_from_str("not valid toml [[[", "bad.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml_str = r#"
[[backends]]
name = "a"
kind = "static"
value = 0.5

[routes.quality]
members = ["a", "missing"]
"#;
        let result = load_from_str(toml_str, "dangling.toml");
        match result {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("routes.quality.members")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_str_unknown_backend_kind_fails() {
        let toml_str = r#"
[[backends]]
name = "a"
kind = "grpc"
"#;
        let result = load_from_str(toml_str, "kind.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("test.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(VALID_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.routes["quality"].members.len(), 2);
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_file_invalid_values_returns_validation_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("invalid.toml");
        std::fs::write(&path, "[training]\nholdout_pct = 90\n").expect("test: write");

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml").unwrap_err();
        assert!(err.to_string().contains("my-source.toml"));
    }
}
