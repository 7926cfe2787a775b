//! Prometheus metrics for the prediction orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** serving traffic.
//! The helper functions (`record_request`, `record_cache_lookup`, …) are
//! no-ops if `init_metrics` was never called, so every component is safe to
//! run in tests without a registry. Observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `prediction_requests_total` | Counter | `model`, `outcome` |
//! | `prediction_latency_seconds` | Histogram | `model` |
//! | `prediction_cache_lookups_total` | Counter | `tier`, `result` |
//! | `prediction_circuit_state` | Gauge | `backend` |
//! | `prediction_feedback_queue_depth` | Gauge | — |
//! | `prediction_feedback_dropped_total` | Counter | — |
//! | `prediction_feedback_outcomes_total` | Counter | `feedback_type` |
//! | `prediction_ensemble_weight` | Gauge | `model` |
//! | `prediction_deployment_traffic_pct` | Gauge | `lineage`, `version` |
//! | `prediction_pipeline_transitions_total` | Counter | `lineage`, `state` |

use crate::ServingError;
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the orchestrator, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Routed requests per model and outcome (`ok`, `cache_hit`, `fallback`, `error`).
    pub requests_total: CounterVec,
    /// End-to-end routing latency per model.
    pub latency: HistogramVec,
    /// Cache lookups per tier and result (`hit`, `miss`, `error`).
    pub cache_lookups: CounterVec,
    /// Breaker state per backend: 0 closed, 1 half-open, 2 open.
    pub circuit_state: IntGaugeVec,
    /// Pending durable writes in the feedback queue.
    pub feedback_queue_depth: IntGauge,
    /// Writes discarded by the drop-oldest overflow policy.
    pub feedback_dropped: IntCounter,
    /// Recorded outcomes per feedback type.
    pub feedback_outcomes: CounterVec,
    /// Normalised ensemble weight per member model.
    pub ensemble_weight: GaugeVec,
    /// Traffic share per lineage version.
    pub deployment_traffic: IntGaugeVec,
    /// Training pipeline state transitions.
    pub pipeline_transitions: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, ServingError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| ServingError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn init_err(e: prometheus::Error) -> ServingError {
    ServingError::Other(format!("metrics init failed: {e}"))
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`ServingError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), ServingError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = build_metrics()?;
    // A racing initialiser produces identical descriptors; first one wins.
    let _ = METRICS.set(metrics);
    Ok(())
}

fn build_metrics() -> Result<Metrics, ServingError> {
    let registry = Registry::new();

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new("prediction_requests_total", "Routed prediction requests"),
            &["model", "outcome"],
        )
        .map_err(init_err)?,
    )?;
    let latency = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new("prediction_latency_seconds", "End-to-end routing latency"),
            &["model"],
        )
        .map_err(init_err)?,
    )?;
    let cache_lookups = register(
        &registry,
        CounterVec::new(
            Opts::new("prediction_cache_lookups_total", "Cache lookups per tier"),
            &["tier", "result"],
        )
        .map_err(init_err)?,
    )?;
    let circuit_state = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(
                "prediction_circuit_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            ),
            &["backend"],
        )
        .map_err(init_err)?,
    )?;
    let feedback_queue_depth = register(
        &registry,
        IntGauge::new(
            "prediction_feedback_queue_depth",
            "Pending durable writes in the feedback queue",
        )
        .map_err(init_err)?,
    )?;
    let feedback_dropped = register(
        &registry,
        IntCounter::new(
            "prediction_feedback_dropped_total",
            "Feedback writes dropped on queue overflow",
        )
        .map_err(init_err)?,
    )?;
    let feedback_outcomes = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "prediction_feedback_outcomes_total",
                "Recorded outcomes per feedback type",
            ),
            &["feedback_type"],
        )
        .map_err(init_err)?,
    )?;
    let ensemble_weight = register(
        &registry,
        GaugeVec::new(
            Opts::new("prediction_ensemble_weight", "Normalised ensemble member weight"),
            &["model"],
        )
        .map_err(init_err)?,
    )?;
    let deployment_traffic = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(
                "prediction_deployment_traffic_pct",
                "Traffic percentage per lineage version",
            ),
            &["lineage", "version"],
        )
        .map_err(init_err)?,
    )?;
    let pipeline_transitions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "prediction_pipeline_transitions_total",
                "Training pipeline state transitions",
            ),
            &["lineage", "state"],
        )
        .map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        latency,
        cache_lookups,
        circuit_state,
        feedback_queue_depth,
        feedback_dropped,
        feedback_outcomes,
        ensemble_weight,
        deployment_traffic,
        pipeline_transitions,
    })
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a routed request and observe its latency.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_request(model: &str, outcome: &str, latency: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[model, outcome]) {
            c.inc();
        }
        if let Ok(h) = m.latency.get_metric_with_label_values(&[model]) {
            h.observe(latency.as_secs_f64());
        }
    }
}

/// Count a cache lookup against one tier.
///
/// `result` is one of `hit`, `miss` or `error`.
pub fn record_cache_lookup(tier: &str, result: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_lookups.get_metric_with_label_values(&[tier, result]) {
            c.inc();
        }
    }
}

/// Publish the numeric state of a backend's circuit breaker.
pub fn set_circuit_state(backend: &str, state: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.circuit_state.get_metric_with_label_values(&[backend]) {
            g.set(state);
        }
    }
}

/// Set the feedback queue depth gauge.
pub fn set_feedback_queue_depth(depth: usize) {
    if let Some(m) = metrics() {
        m.feedback_queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Add to the dropped-write counter.
pub fn inc_feedback_dropped(count: u64) {
    if let Some(m) = metrics() {
        m.feedback_dropped.inc_by(count);
    }
}

/// Count a recorded outcome by feedback type.
pub fn inc_feedback_outcome(feedback_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.feedback_outcomes.get_metric_with_label_values(&[feedback_type]) {
            c.inc();
        }
    }
}

/// Publish a member's normalised ensemble weight.
pub fn set_ensemble_weight(model: &str, weight: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.ensemble_weight.get_metric_with_label_values(&[model]) {
            g.set(weight);
        }
    }
}

/// Publish the traffic share of one lineage version.
pub fn set_deployment_traffic(lineage: &str, version: &str, pct: u8) {
    if let Some(m) = metrics() {
        if let Ok(g) = m
            .deployment_traffic
            .get_metric_with_label_values(&[lineage, version])
        {
            g.set(i64::from(pct));
        }
    }
}

/// Count a training pipeline transition into `state`.
pub fn inc_pipeline_transition(lineage: &str, state: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .pipeline_transitions
            .get_metric_with_label_values(&[lineage, state])
        {
            c.inc();
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Request counters keyed by `"model:outcome"`, used by the status endpoint.
///
/// Returns an empty map if metrics have not been initialised.
pub fn request_summary() -> HashMap<String, u64> {
    let Some(m) = metrics() else {
        return HashMap::new();
    };

    let mut summary = HashMap::new();
    for family in m.requests_total.collect() {
        for metric in family.get_metric() {
            let label = |name: &str| {
                metric
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == name)
                    .map_or("unknown", |l| l.get_value())
                    .to_string()
            };
            let key = format!("{}:{}", label("model"), label("outcome"));
            summary.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_metrics_in_isolated_registry() {
        let m = build_metrics().unwrap();
        m.requests_total
            .with_label_values(&["quality", "ok"])
            .inc();
        m.feedback_dropped.inc_by(3);
        assert_eq!(
            m.requests_total
                .with_label_values(&["quality", "ok"])
                .get(),
            1.0
        );
        assert_eq!(m.feedback_dropped.get(), 3);
        assert!(!m.registry.gather().is_empty());
    }

    #[test]
    fn test_helpers_before_init_do_not_panic() {
        record_request("m", "ok", Duration::from_millis(5));
        record_cache_lookup("memory", "hit");
        set_circuit_state("b", 2);
        set_feedback_queue_depth(10);
        inc_feedback_dropped(1);
        inc_feedback_outcome("bot");
        set_ensemble_weight("m", 0.5);
        set_deployment_traffic("l", "v1", 100);
        inc_pipeline_transition("l", "collecting");
    }

    #[test]
    fn test_init_metrics_idempotent_and_exports_text() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        record_request("text-model", "ok", Duration::from_millis(2));
        let text = gather_metrics();
        assert!(text.contains("prediction_requests_total"));
        assert!(request_summary().contains_key("text-model:ok"));
    }
}
