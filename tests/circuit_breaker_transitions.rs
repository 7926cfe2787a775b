//! # Circuit Breaker State Machine
//!
//! Drives a breaker through Closed → Open → HalfOpen → Closed with a
//! simulated backend, and checks that an open breaker in front of a route
//! sends traffic to the fallback without calling the failing backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_prediction_orchestrator::config::{BackendConfig, BackendKind, RouteConfig, ServingConfig};
use tokio_prediction_orchestrator::feedback::MemoryStore;
use tokio_prediction_orchestrator::resilience::{
    BreakerSettings, CircuitBreaker, CircuitBreakerError, CircuitStatus,
};
use tokio_prediction_orchestrator::training::CalibrationTrainer;
use tokio_prediction_orchestrator::{
    PredictionRequest, PredictionSource, Predictor, PredictorRegistry, ServingCore, StaticPredictor,
};

/// Backend that fails for calls in `[fail_from, recover_at)`.
struct SimulatedBackend {
    calls: AtomicUsize,
    fail_from: usize,
    recover_at: usize,
}

impl SimulatedBackend {
    fn new(fail_from: usize, recover_at: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_from,
            recover_at,
        }
    }

    async fn predict(&self) -> Result<f64, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_from && n < self.recover_at {
            Err(format!("simulated failure at call {n}"))
        } else {
            Ok(0.5)
        }
    }
}

fn settings(threshold: usize, cooldown_ms: u64) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: threshold,
        failure_rate_threshold: 1.0,
        window_size: 50,
        min_calls: 50,
        cooldown_ms,
    }
}

#[tokio::test]
async fn test_consecutive_failures_open_then_trial_closes() {
    let backend = SimulatedBackend::new(0, 3);
    let breaker = CircuitBreaker::new("sim", settings(3, 50));

    for _ in 0..3 {
        let result = breaker.call(|| backend.predict()).await;
        assert!(matches!(result, Err(CircuitBreakerError::Failed(_))));
    }
    assert_eq!(breaker.status(), CircuitStatus::Open);

    // Rejected without reaching the backend while cooling down.
    let result = breaker.call(|| backend.predict()).await;
    assert!(matches!(result, Err(CircuitBreakerError::Open)));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let result = breaker.call(|| backend.predict()).await;
    assert!(result.is_ok());
    assert_eq!(breaker.status(), CircuitStatus::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.total_failures, 3);
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.rejected, 1);
}

#[tokio::test]
async fn test_failed_trial_reopens() {
    let backend = SimulatedBackend::new(0, 100);
    let breaker = CircuitBreaker::new("sim", settings(2, 30));

    for _ in 0..2 {
        let _ = breaker.call(|| backend.predict()).await;
    }
    assert_eq!(breaker.status(), CircuitStatus::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = breaker.call(|| backend.predict()).await;
    assert!(matches!(result, Err(CircuitBreakerError::Failed(_))));
    assert_eq!(breaker.status(), CircuitStatus::Open);
}

#[tokio::test]
async fn test_failures_below_threshold_keep_closed() {
    let backend = SimulatedBackend::new(0, 4);
    let breaker = CircuitBreaker::new("sim", settings(5, 1_000));

    for _ in 0..4 {
        let _ = breaker.call(|| backend.predict()).await;
    }
    assert_eq!(breaker.status(), CircuitStatus::Closed);

    // A success resets the consecutive count.
    assert!(breaker.call(|| backend.predict()).await.is_ok());
    assert_eq!(breaker.stats().consecutive_failures, 0);
}

#[tokio::test]
async fn test_rate_rule_opens_on_interleaved_failures() {
    let breaker = CircuitBreaker::new(
        "sim",
        BreakerSettings {
            failure_threshold: 100,
            failure_rate_threshold: 0.5,
            window_size: 10,
            min_calls: 10,
            cooldown_ms: 1_000,
        },
    );

    for i in 0..10 {
        let fail = i % 2 == 1;
        let _ = breaker
            .call(|| async move { if fail { Err("boom") } else { Ok(()) } })
            .await;
    }
    assert_eq!(breaker.status(), CircuitStatus::Open);
}

#[tokio::test]
async fn test_open_breaker_routes_to_fallback() {
    let mut config = ServingConfig::default();
    config.recovery.enabled = false;
    config.routing.retry_attempts = 1;
    config.resilience = settings(2, 60_000);
    for (name, value) in [("primary", 0.9), ("safe", 0.3)] {
        config.backends.push(BackendConfig {
            name: name.into(),
            version: "v1".into(),
            kind: BackendKind::Static {
                value,
                confidence: 0.9,
            },
        });
    }
    config.routes.insert(
        "quality".into(),
        RouteConfig {
            members: vec!["primary".into()],
            fallback: Some("safe".into()),
            strategy: None,
        },
    );

    let registry = Arc::new(PredictorRegistry::new());
    let primary = Arc::new(StaticPredictor::new("primary", 0.9, 0.9));
    primary.set_failing(true);
    registry.register("primary@v1", primary.clone() as Arc<dyn Predictor>);

    let core = ServingCore::build(
        config,
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(CalibrationTrainer::default()),
    )
    .await
    .unwrap();

    for i in 0..4 {
        let request = PredictionRequest::new(json!({"i": i}));
        let out = core.predict("quality", &request).await.unwrap();
        assert_eq!(out.source, PredictionSource::Fallback);
        assert!((out.value - 0.3).abs() < 1e-9);
    }

    // Two failing calls opened the breaker; later requests never reached it.
    assert_eq!(primary.calls(), 2);
    assert_eq!(core.breakers.get("primary@v1").status(), CircuitStatus::Open);
}
