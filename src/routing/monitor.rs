//! Per-model request tracking.
//!
//! The router reports every routed call here exactly once, after the outcome
//! is known. Counters are atomics so tracking never contends with other
//! requests of the same model beyond a shard lookup.
//!
//! # Panics
//!
//! Nothing in this module panics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::PredictionRequest;

const RECENT_LIMIT: usize = 256;

/// What happened to one routed call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    /// Wall-clock time spent in `route`.
    pub latency: Duration,
    /// A prediction was returned.
    pub success: bool,
    /// Error text when `success` is false.
    pub error: Option<String>,
    /// Answered from an exact or near-duplicate cache hit.
    pub cache_hit: bool,
    /// Answered by the route's fallback backend.
    pub fallback_used: bool,
}

impl RequestOutcome {
    /// Label for metrics: `cache`, `fallback`, `ok` or `error`.
    pub fn label(&self) -> &'static str {
        match (self.success, self.cache_hit, self.fallback_used) {
            (false, _, _) => "error",
            (true, true, _) => "cache",
            (true, false, true) => "fallback",
            (true, false, false) => "ok",
        }
    }
}

/// One tracked call, kept in a short ring for the operational surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedRequest {
    /// Routed model id.
    pub model_id: String,
    /// Request id.
    pub request_id: String,
    /// Latency in milliseconds.
    pub latency_ms: f64,
    /// Success flag.
    pub success: bool,
    /// Error text.
    pub error: Option<String>,
    /// Cache hit flag.
    pub cache_hit: bool,
    /// Fallback flag.
    pub fallback_used: bool,
    /// When it was tracked.
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ModelCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    latency_us: AtomicU64,
}

/// Aggregated view of one model id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequestStats {
    /// Model id.
    pub model_id: String,
    /// Routed calls.
    pub requests: u64,
    /// Calls that returned an error.
    pub errors: u64,
    /// Calls answered from cache.
    pub cache_hits: u64,
    /// Calls answered by the fallback backend.
    pub fallbacks: u64,
    /// Mean latency in milliseconds.
    pub mean_latency_ms: f64,
    /// `errors / requests`.
    pub error_rate: f64,
}

/// Request tracker shared by every router task.
#[derive(Debug, Default)]
pub struct RequestMonitor {
    models: DashMap<String, ModelCounters>,
    total: AtomicU64,
    recent: Mutex<VecDeque<TrackedRequest>>,
}

impl RequestMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one routed call.
    pub fn track_request(&self, model_id: &str, request: &PredictionRequest, outcome: &RequestOutcome) {
        {
            let counters = self.models.entry(model_id.to_string()).or_default();
            counters.requests.fetch_add(1, Ordering::Relaxed);
            if !outcome.success {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            if outcome.cache_hit {
                counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            if outcome.fallback_used {
                counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            let micros = u64::try_from(outcome.latency.as_micros()).unwrap_or(u64::MAX);
            counters.latency_us.fetch_add(micros, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut recent = self.recent.lock();
        recent.push_back(TrackedRequest {
            model_id: model_id.to_string(),
            request_id: request.id.clone(),
            latency_ms: outcome.latency.as_secs_f64() * 1000.0,
            success: outcome.success,
            error: outcome.error.clone(),
            cache_hit: outcome.cache_hit,
            fallback_used: outcome.fallback_used,
            at: Utc::now(),
        });
        while recent.len() > RECENT_LIMIT {
            recent.pop_front();
        }
    }

    /// Calls tracked across all models.
    pub fn total_tracked(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Stats of one model, if it was ever routed.
    pub fn model_stats(&self, model_id: &str) -> Option<ModelRequestStats> {
        self.models.get(model_id).map(|c| stats_of(model_id, &c))
    }

    /// Stats of every model, sorted by id.
    pub fn snapshot(&self) -> Vec<ModelRequestStats> {
        let mut out: Vec<_> = self
            .models
            .iter()
            .map(|entry| stats_of(entry.key(), entry.value()))
            .collect();
        out.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        out
    }

    /// Most recent tracked calls, oldest first.
    pub fn recent(&self) -> Vec<TrackedRequest> {
        self.recent.lock().iter().cloned().collect()
    }
}

fn stats_of(model_id: &str, c: &ModelCounters) -> ModelRequestStats {
    let requests = c.requests.load(Ordering::Relaxed);
    let errors = c.errors.load(Ordering::Relaxed);
    let latency_us = c.latency_us.load(Ordering::Relaxed);
    let (mean_latency_ms, error_rate) = if requests == 0 {
        (0.0, 0.0)
    } else {
        (
            latency_us as f64 / requests as f64 / 1000.0,
            errors as f64 / requests as f64,
        )
    };
    ModelRequestStats {
        model_id: model_id.to_string(),
        requests,
        errors,
        cache_hits: c.cache_hits.load(Ordering::Relaxed),
        fallbacks: c.fallbacks.load(Ordering::Relaxed),
        mean_latency_ms,
        error_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(success: bool, cache_hit: bool, fallback_used: bool, ms: u64) -> RequestOutcome {
        RequestOutcome {
            latency: Duration::from_millis(ms),
            success,
            error: (!success).then(|| "boom".to_string()),
            cache_hit,
            fallback_used,
        }
    }

    #[test]
    fn test_counts_per_model() {
        let m = RequestMonitor::new();
        let req = PredictionRequest::new(json!({}));
        m.track_request("quality", &req, &outcome(true, false, false, 10));
        m.track_request("quality", &req, &outcome(true, true, false, 2));
        m.track_request("quality", &req, &outcome(false, false, false, 30));
        m.track_request("toxicity", &req, &outcome(true, false, true, 20));

        assert_eq!(m.total_tracked(), 4);
        let q = m.model_stats("quality").unwrap();
        assert_eq!(q.requests, 3);
        assert_eq!(q.errors, 1);
        assert_eq!(q.cache_hits, 1);
        assert!((q.mean_latency_ms - 14.0).abs() < 1e-6);
        assert_eq!(m.model_stats("toxicity").unwrap().fallbacks, 1);
        assert!(m.model_stats("missing").is_none());
    }

    #[test]
    fn test_recent_is_bounded() {
        let m = RequestMonitor::new();
        let req = PredictionRequest::new(json!({}));
        for _ in 0..(RECENT_LIMIT + 10) {
            m.track_request("quality", &req, &outcome(true, false, false, 1));
        }
        assert_eq!(m.recent().len(), RECENT_LIMIT);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome(false, true, false, 0).label(), "error");
        assert_eq!(outcome(true, true, false, 0).label(), "cache");
        assert_eq!(outcome(true, false, true, 0).label(), "fallback");
        assert_eq!(outcome(true, false, false, 0).label(), "ok");
    }
}
