//! # Request Tracking Coverage
//!
//! Every routed call is tracked exactly once, whatever path answered it:
//! cache hits, ensemble answers, fallbacks, failures and unknown models.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio_prediction_orchestrator::config::{BackendConfig, BackendKind, RouteConfig, ServingConfig};
use tokio_prediction_orchestrator::feedback::MemoryStore;
use tokio_prediction_orchestrator::training::CalibrationTrainer;
use tokio_prediction_orchestrator::{
    PredictionRequest, PredictionSource, Predictor, PredictorRegistry, ServingCore, ServingError,
    StaticPredictor,
};

fn backend(name: &str, value: f64) -> BackendConfig {
    BackendConfig {
        name: name.into(),
        version: "v1".into(),
        kind: BackendKind::Static {
            value,
            confidence: 0.8,
        },
    }
}

fn route(members: &[&str], fallback: Option<&str>) -> RouteConfig {
    RouteConfig {
        members: members.iter().map(|m| m.to_string()).collect(),
        fallback: fallback.map(str::to_string),
        strategy: None,
    }
}

async fn core() -> (ServingCore, Arc<StaticPredictor>) {
    let mut config = ServingConfig::default();
    config.recovery.enabled = false;
    config.routing.retry_attempts = 1;
    config.backends = vec![
        backend("a", 0.4),
        backend("b", 0.6),
        backend("flaky", 0.5),
        backend("safe", 0.2),
    ];
    config.routes.insert("quality".into(), route(&["a", "b"], None));
    config.routes.insert("guarded".into(), route(&["flaky"], Some("safe")));
    config.routes.insert("broken".into(), route(&["flaky"], None));

    let registry = Arc::new(PredictorRegistry::new());
    let flaky = Arc::new(StaticPredictor::new("flaky", 0.5, 0.8));
    flaky.set_failing(true);
    registry.register("flaky@v1", flaky.clone() as Arc<dyn Predictor>);

    let core = ServingCore::build(
        config,
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(CalibrationTrainer::default()),
    )
    .await
    .unwrap();
    (core, flaky)
}

#[tokio::test]
async fn test_concurrent_mixed_routes_are_each_tracked_once() {
    let (core, _flaky) = core().await;
    let core = Arc::new(core);

    // Warm one cache entry so a share of the traffic hits it.
    core.predict("quality", &PredictionRequest::new(json!({"text": "warm"})))
        .await
        .unwrap();
    assert_eq!(core.monitor.total_tracked(), 1);

    let calls: Vec<(&str, serde_json::Value)> = (0..40)
        .map(|i| match i % 5 {
            0 => ("quality", json!({"text": "warm"})),
            1 => ("quality", json!({"text": format!("fresh-{i}")})),
            2 => ("guarded", json!({"i": i})),
            3 => ("broken", json!({"i": i})),
            _ => ("unknown", json!({"i": i})),
        })
        .collect();

    let results = join_all(calls.iter().map(|(model, payload)| {
        let core = Arc::clone(&core);
        let request = PredictionRequest::new(payload.clone());
        let model = model.to_string();
        async move { core.predict(&model, &request).await }
    }))
    .await;

    assert_eq!(core.monitor.total_tracked(), 41);

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 24);
    let cache_hits = results
        .iter()
        .filter(|r| matches!(r, Ok(p) if p.source == PredictionSource::Cache))
        .count();
    assert_eq!(cache_hits, 8);
    let invalid = results
        .iter()
        .filter(|r| matches!(r, Err(ServingError::InvalidModel(_))))
        .count();
    assert_eq!(invalid, 8);

    let quality = core.monitor.model_stats("quality").unwrap();
    assert_eq!(quality.requests, 17);
    assert_eq!(quality.cache_hits, 8);
    let guarded = core.monitor.model_stats("guarded").unwrap();
    assert_eq!(guarded.fallbacks, 8);
    let broken = core.monitor.model_stats("broken").unwrap();
    assert_eq!(broken.errors, 8);
    let unknown = core.monitor.model_stats("unknown").unwrap();
    assert_eq!(unknown.errors, 8);
}

#[tokio::test]
async fn test_cancelled_request_is_tracked_once() {
    let mut config = ServingConfig::default();
    config.recovery.enabled = false;
    config.backends = vec![backend("slow", 0.5)];
    config.routes.insert("slow".into(), route(&["slow"], None));

    let registry = Arc::new(PredictorRegistry::new());
    registry.register(
        "slow@v1",
        Arc::new(StaticPredictor::new("slow", 0.5, 0.8).with_delay(Duration::from_secs(5)))
            as Arc<dyn Predictor>,
    );
    let core = ServingCore::build(
        config,
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(CalibrationTrainer::default()),
    )
    .await
    .unwrap();

    let request = PredictionRequest::new(json!("x"));
    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), core.predict("slow", &request)).await;
    assert!(timed_out.is_err());

    assert_eq!(core.monitor.total_tracked(), 1);
    let recent = core.monitor.recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_every_answer_is_recorded_for_feedback() {
    let (core, flaky) = core().await;
    let a = core
        .predict("quality", &PredictionRequest::new(json!({"text": "one"})))
        .await
        .unwrap();
    let b = core
        .predict("quality", &PredictionRequest::new(json!({"text": "one"})))
        .await
        .unwrap();
    let c = core
        .predict("guarded", &PredictionRequest::new(json!({"text": "two"})))
        .await
        .unwrap();
    assert_eq!(b.source, PredictionSource::Cache);
    assert_eq!(c.source, PredictionSource::Fallback);
    assert_eq!(flaky.calls(), 1);

    let ids = [a.prediction_id, b.prediction_id, c.prediction_id];
    assert_eq!(
        ids.iter().collect::<std::collections::HashSet<_>>().len(),
        3
    );
    assert_eq!(core.feedback.queue().len(), 3);
    let report = core.feedback.flush_queue().await.unwrap();
    assert_eq!(report.predictions_written, 3);
}
