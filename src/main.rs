//! Serving binary for tokio-prediction-orchestrator
//!
//! Loads a serving config, builds the core, starts the background tasks and,
//! with the `web-api` feature, serves HTTP until Ctrl-C.
//!
//! ## Usage
//!
//! ```text
//! prediction-orchestrator --config serving.toml
//! prediction-orchestrator --print-schema
//! ```
//!
//! ## Environment Variables
//!
//! - `PREDICTION_CONFIG=path` — config file when `--config` is not given
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_prediction_orchestrator::config::{loader, LogFormat, ServingConfig};
use tokio_prediction_orchestrator::{init_tracing_with, metrics, ServingCore};
use tracing::{info, warn};

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("PREDICTION_CONFIG").map(PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if std::env::args().any(|a| a == "--print-schema") {
        let schema = schemars::schema_for!(ServingConfig);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = match config_path() {
        Some(path) => loader::load_from_file(&path)?,
        None => ServingConfig::default(),
    };

    let _ = init_tracing_with(config.observability.log_format);
    if config.observability.log_format == LogFormat::Json {
        info!("structured logging enabled");
    }

    if config.observability.metrics_enabled {
        metrics::init_metrics()?;
    }

    info!(service = %config.service.name, "Starting prediction orchestrator");
    if config.backends.is_empty() {
        warn!("no backends configured; every predict call will fail with an unknown model");
    }

    let core = Arc::new(ServingCore::from_config(config).await?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = core.start_background(shutdown_rx.clone()).await;

    #[cfg(feature = "web-api")]
    let server = {
        let core = Arc::clone(&core);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { tokio_prediction_orchestrator::web_api::start_server(core, rx).await })
    };
    #[cfg(not(feature = "web-api"))]
    info!("built without the web-api feature; serving in-process only");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    #[cfg(feature = "web-api")]
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "web API exited with an error"),
        Err(e) => warn!(error = %e, "web API task panicked"),
    }

    tasks.join().await;
    match core.feedback.flush_queue().await {
        Ok(report) => info!(
            predictions = report.predictions_written,
            outcomes = report.outcomes_applied,
            "final feedback flush"
        ),
        Err(e) => warn!(error = %e, remaining = core.feedback.queue().len(), "final flush failed"),
    }

    info!("Shutdown complete");
    Ok(())
}
