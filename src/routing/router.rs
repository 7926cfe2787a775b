//! Request routing.
//!
//! The [`RequestRouter`] answers `route(model_id, request)` by walking, in
//! order: route validation, exact cache, opt-in near-duplicate cache, traffic
//! resolution per member lineage, concurrent member calls (breaker → retry →
//! timeout), ensemble combination, cache write, prediction recording and
//! request tracking.

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::monitor::{RequestMonitor, RequestOutcome};
use super::retry::RetryPolicy;
use super::table::{RoutingTableHandle, TrafficSlot};
use crate::backend::PredictorRegistry;
use crate::cache::{cache_key, MultiTierCache};
use crate::ensemble::{EnsemblePredictor, EnsembleStrategy, MemberPrediction};
use crate::feedback::{FeedbackCollector, NewPrediction};
use crate::metrics;
use crate::resilience::{BreakerRegistry, CircuitBreakerError};
use crate::{PredictionRequest, PredictionSource, RoutedPrediction, ServingError};

/// Router tuning (`[routing]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RouterSettings {
    /// Per-attempt timeout of a member call.
    pub member_timeout_ms: u64,
    /// Attempts per member call, first one included.
    pub retry_attempts: usize,
    /// Delay before the first retry; doubles per attempt.
    pub retry_base_ms: u64,
    /// Write model answers to the cache.
    pub cache_predictions: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            member_timeout_ms: 2_000,
            retry_attempts: 2,
            retry_base_ms: 25,
            cache_predictions: true,
        }
    }
}

impl RouterSettings {
    /// Member timeout as a [`Duration`].
    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.member_timeout_ms)
    }

    /// Retry policy for member calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_attempts.max(1),
            Duration::from_millis(self.retry_base_ms),
        )
    }
}

/// What the cache holds for a routed answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPrediction {
    value: f64,
    confidence: f64,
    #[serde(default)]
    members: Vec<MemberPrediction>,
}

/// Tracks the call exactly once: on `finish`, or on drop if the routing
/// future was cancelled first.
struct TrackGuard<'a> {
    monitor: &'a RequestMonitor,
    model_id: &'a str,
    request: &'a PredictionRequest,
    started: Instant,
    tracked: bool,
}

impl TrackGuard<'_> {
    fn finish(&mut self, result: &Result<RoutedPrediction, ServingError>) {
        let outcome = match result {
            Ok(p) => RequestOutcome {
                latency: self.started.elapsed(),
                success: true,
                error: None,
                cache_hit: p.source.is_cache(),
                fallback_used: p.source == PredictionSource::Fallback,
            },
            Err(e) => RequestOutcome {
                latency: self.started.elapsed(),
                success: false,
                error: Some(e.to_string()),
                cache_hit: false,
                fallback_used: false,
            },
        };
        self.track(&outcome);
    }

    fn track(&mut self, outcome: &RequestOutcome) {
        if self.tracked {
            return;
        }
        self.tracked = true;
        self.monitor.track_request(self.model_id, self.request, outcome);
        metrics::record_request(self.model_id, outcome.label(), outcome.latency);
    }
}

impl Drop for TrackGuard<'_> {
    fn drop(&mut self) {
        if !self.tracked {
            let outcome = RequestOutcome {
                latency: self.started.elapsed(),
                success: false,
                error: Some("cancelled".to_string()),
                cache_hit: false,
                fallback_used: false,
            };
            self.track(&outcome);
        }
    }
}

/// Routes requests to member backends, combines their answers and records
/// every prediction for later feedback.
pub struct RequestRouter {
    table: Arc<RoutingTableHandle>,
    registry: Arc<PredictorRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<MultiTierCache>,
    ensemble: Arc<EnsemblePredictor>,
    feedback: Arc<FeedbackCollector>,
    monitor: Arc<RequestMonitor>,
    settings: RouterSettings,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("settings", &self.settings)
            .field("generation", &self.table.load().generation())
            .finish()
    }
}

impl RequestRouter {
    /// Wire a router over shared components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: Arc<RoutingTableHandle>,
        registry: Arc<PredictorRegistry>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<MultiTierCache>,
        ensemble: Arc<EnsemblePredictor>,
        feedback: Arc<FeedbackCollector>,
        monitor: Arc<RequestMonitor>,
        settings: RouterSettings,
    ) -> Self {
        let retry = settings.retry_policy();
        Self {
            table,
            registry,
            breakers,
            cache,
            ensemble,
            feedback,
            monitor,
            settings,
            retry,
        }
    }

    /// Request tracker fed by this router.
    pub fn monitor(&self) -> &Arc<RequestMonitor> {
        &self.monitor
    }

    /// Routing table handle.
    pub fn table(&self) -> &Arc<RoutingTableHandle> {
        &self.table
    }

    /// Route one request.
    ///
    /// The call is tracked exactly once whatever the outcome, before this
    /// function returns.
    ///
    /// # Errors
    ///
    /// - [`ServingError::InvalidModel`] if `model_id` has no route (no cache
    ///   lookup is made).
    /// - [`ServingError::NoPrediction`] if every member failed and there is no
    ///   working fallback.
    pub async fn route(
        &self,
        model_id: &str,
        request: &PredictionRequest,
    ) -> Result<RoutedPrediction, ServingError> {
        let mut guard = TrackGuard {
            monitor: &self.monitor,
            model_id,
            request,
            started: Instant::now(),
            tracked: false,
        };
        let result = self.route_inner(model_id, request).await;
        guard.finish(&result);
        result
    }

    async fn route_inner(
        &self,
        model_id: &str,
        request: &PredictionRequest,
    ) -> Result<RoutedPrediction, ServingError> {
        let table = self.table.load();
        let spec = table
            .route(model_id)
            .cloned()
            .ok_or_else(|| ServingError::InvalidModel(model_id.to_string()))?;

        let strategy = request.strategy.or(spec.strategy);
        let key = cache_key(model_id, &request.payload);
        if let Some(hit) = self.cache.get(&key).await.and_then(|raw| decode(&raw)) {
            let hit = self.recombine(hit, strategy);
            return Ok(self.record(model_id, request, hit, PredictionSource::Cache));
        }
        if request.allow_similar {
            let threshold = self.cache.settings().similarity_threshold;
            if let Some(hit) = self
                .cache
                .get_similar(model_id, &request.payload_text(), threshold)
                .await
            {
                if let Some(cached) = decode(&hit.value) {
                    let cached = self.recombine(cached, strategy);
                    return Ok(self.record(model_id, request, cached, PredictionSource::SimilarCache));
                }
            }
        }

        let slots: Vec<(String, TrafficSlot)> = spec
            .members
            .iter()
            .filter_map(|lineage| {
                let slot = table.resolve(lineage, &request.id);
                if slot.is_none() {
                    warn!(model = model_id, lineage = %lineage, "member lineage has no live version");
                }
                slot.map(|s| (lineage.clone(), s.clone()))
            })
            .collect();

        let results = join_all(
            slots
                .iter()
                .map(|(lineage, slot)| self.call_member(lineage, &slot.version, &slot.backend, request)),
        )
        .await;

        let mut members = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(m) => members.push(m),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if members.is_empty() {
            if let Some(fallback) = spec.fallback.as_deref() {
                match self.call_member(fallback, "", fallback, request).await {
                    Ok(member) => {
                        warn!(model = model_id, fallback = fallback, "all members failed, fallback answered");
                        let cached = CachedPrediction {
                            value: member.value,
                            confidence: member.confidence,
                            members: vec![member],
                        };
                        return Ok(self.record(model_id, request, cached, PredictionSource::Fallback));
                    }
                    Err(e) => failures.push(format!("fallback: {e}")),
                }
            }
            if failures.is_empty() {
                failures.push("no live members".to_string());
            }
            return Err(ServingError::NoPrediction {
                model_id: model_id.to_string(),
                reason: failures.join("; "),
            });
        }

        let combined = self
            .ensemble
            .combine(&members, strategy)
            .map_err(|e| ServingError::NoPrediction {
                model_id: model_id.to_string(),
                reason: e.to_string(),
            })?;
        let source = if members.len() == 1 {
            PredictionSource::Model
        } else {
            PredictionSource::Ensemble
        };
        let answer = CachedPrediction {
            value: combined.value,
            confidence: combined.confidence,
            members,
        };

        if self.settings.cache_predictions {
            match serde_json::to_string(&answer) {
                Ok(encoded) => {
                    self.cache.set(key.clone(), encoded, self.cache.default_ttl()).await;
                    self.cache.index_similar(model_id, &request.payload_text(), &key);
                }
                Err(e) => debug!(model = model_id, error = %e, "prediction not cacheable"),
            }
        }

        Ok(self.record(model_id, request, answer, source))
    }

    /// Call one backend through its breaker, with bounded retry and a
    /// per-attempt timeout.
    async fn call_member(
        &self,
        lineage: &str,
        version: &str,
        backend: &str,
        request: &PredictionRequest,
    ) -> Result<MemberPrediction, ServingError> {
        let predictor = self
            .registry
            .get(backend)
            .ok_or_else(|| ServingError::BackendUnavailable {
                backend: backend.to_string(),
                reason: "not registered".to_string(),
            })?;
        let breaker = self.breakers.get(backend);
        let timeout = self.settings.member_timeout();

        let result = breaker
            .call(|| {
                self.retry.retry_if(
                    || {
                        let predictor = Arc::clone(&predictor);
                        async move {
                            match tokio::time::timeout(timeout, predictor.predict(request)).await {
                                Ok(answer) => answer.and_then(|raw| raw.sanitize(backend)),
                                Err(_) => Err(ServingError::BackendUnavailable {
                                    backend: backend.to_string(),
                                    reason: format!("timed out after {timeout:?}"),
                                }),
                            }
                        }
                    },
                    |e| matches!(e, ServingError::BackendUnavailable { .. }),
                )
            })
            .await;

        match result {
            Ok(raw) => {
                debug!(lineage = lineage, backend = backend, value = raw.value, "member answered");
                Ok(MemberPrediction::new(lineage, raw.value, raw.confidence).with_source(version, backend))
            }
            Err(CircuitBreakerError::Open) => {
                debug!(backend = backend, "member skipped, circuit open");
                Err(ServingError::CircuitOpen(backend.to_string()))
            }
            Err(CircuitBreakerError::Failed(e)) => Err(e),
        }
    }

    /// Queue the prediction record and build the response.
    /// Cache entries hold member outputs; the combined value is recomputed so
    /// each caller gets the strategy it asked for.
    fn recombine(&self, cached: CachedPrediction, strategy: Option<EnsembleStrategy>) -> CachedPrediction {
        if cached.members.len() < 2 {
            return cached;
        }
        match self.ensemble.combine(&cached.members, strategy) {
            Ok(combined) => CachedPrediction {
                value: combined.value,
                confidence: combined.confidence,
                members: cached.members,
            },
            Err(e) => {
                debug!(error = %e, "cached members not recombined");
                cached
            }
        }
    }

    fn record(
        &self,
        model_id: &str,
        request: &PredictionRequest,
        answer: CachedPrediction,
        source: PredictionSource,
    ) -> RoutedPrediction {
        let model_version = answer
            .members
            .iter()
            .map(|m| {
                if m.version.is_empty() {
                    m.model_id.clone()
                } else {
                    format!("{}@{}", m.model_id, m.version)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let prediction_id = self.feedback.write_prediction(
            uuid::Uuid::new_v4().to_string(),
            NewPrediction {
                service_name: request.service.clone(),
                model_id: model_id.to_string(),
                prediction_type: request.prediction_type.clone(),
                predicted_value: answer.value,
                confidence: answer.confidence,
                context: serde_json::json!({
                    "request_id": request.id,
                    "payload": request.payload,
                }),
                model_version,
                source,
                members: answer.members.clone(),
            },
        );
        RoutedPrediction {
            value: answer.value,
            confidence: answer.confidence,
            source,
            prediction_id,
            members: answer.members,
        }
    }
}

fn decode(raw: &str) -> Option<CachedPrediction> {
    match serde_json::from_str::<CachedPrediction>(raw) {
        Ok(p) if p.value.is_finite() && p.confidence.is_finite() => Some(p),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "undecodable cache entry ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticPredictor;
    use crate::cache::CacheSettings;
    use crate::ensemble::EnsembleSettings;
    use crate::feedback::{FeedbackSettings, MemoryStore};
    use crate::resilience::BreakerSettings;
    use crate::routing::table::{RouteSpec, RoutingTable};
    use serde_json::json;

    struct Fixture {
        router: RequestRouter,
        alpha: Arc<StaticPredictor>,
        beta: Arc<StaticPredictor>,
        feedback: Arc<FeedbackCollector>,
    }

    fn slot(backend: &str) -> Vec<TrafficSlot> {
        vec![TrafficSlot {
            version: "v1".into(),
            backend: backend.into(),
            traffic_pct: 100,
        }]
    }

    fn fixture(fallback: bool) -> Fixture {
        let alpha = Arc::new(StaticPredictor::new("alpha", 0.8, 0.9));
        let beta = Arc::new(StaticPredictor::new("beta", 0.4, 0.3));
        let registry = Arc::new(PredictorRegistry::new());
        registry.register("alpha@v1", alpha.clone());
        registry.register("beta@v1", beta.clone());
        registry.register("safe", Arc::new(StaticPredictor::new("safe", 0.5, 0.2)));

        let mut spec = RouteSpec::new(["alpha", "beta"]);
        if fallback {
            spec = spec.with_fallback("safe");
        }
        let table = RoutingTable::new()
            .with_route("quality", spec)
            .with_lineage("alpha", slot("alpha@v1"))
            .with_lineage("beta", slot("beta@v1"));

        let feedback = Arc::new(FeedbackCollector::new(
            Arc::new(MemoryStore::new()),
            FeedbackSettings::default(),
        ));
        let router = RequestRouter::new(
            Arc::new(RoutingTableHandle::new(table)),
            registry,
            Arc::new(BreakerRegistry::new(BreakerSettings {
                failure_threshold: 2,
                cooldown_ms: 60_000,
                ..BreakerSettings::default()
            })),
            Arc::new(MultiTierCache::memory_only(CacheSettings::default())),
            Arc::new(EnsemblePredictor::new(EnsembleSettings::default())),
            feedback.clone(),
            Arc::new(RequestMonitor::new()),
            RouterSettings {
                retry_attempts: 1,
                ..RouterSettings::default()
            },
        );
        Fixture {
            router,
            alpha,
            beta,
            feedback,
        }
    }

    #[tokio::test]
    async fn test_unknown_model_fails_fast_and_is_tracked() {
        let f = fixture(false);
        let req = PredictionRequest::new(json!("x"));
        let err = f.router.route("nope", &req).await.unwrap_err();
        assert_eq!(err, ServingError::InvalidModel("nope".into()));
        assert_eq!(f.router.monitor().total_tracked(), 1);
        assert_eq!(f.router.cache.stats().lookups, 0);
    }

    #[tokio::test]
    async fn test_ensemble_then_cache_hit() {
        let f = fixture(false);
        let req = PredictionRequest::new(json!({"text": "hello"}));
        let first = f.router.route("quality", &req).await.unwrap();
        assert_eq!(first.source, PredictionSource::Ensemble);
        assert!(first.value >= 0.4 && first.value <= 0.8);
        assert_eq!(first.members.len(), 2);

        let second = f.router.route("quality", &req).await.unwrap();
        assert_eq!(second.source, PredictionSource::Cache);
        assert!((second.value - first.value).abs() < 1e-12);
        assert_ne!(second.prediction_id, first.prediction_id);
        assert_eq!(f.alpha.calls(), 1);
        assert_eq!(f.router.monitor().model_stats("quality").unwrap().cache_hits, 1);
        assert_eq!(f.feedback.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_honours_requested_strategy() {
        let f = fixture(false);
        let payload = json!({"text": "strategies"});
        let weighted = f
            .router
            .route(
                "quality",
                &PredictionRequest::new(payload.clone()).with_strategy(EnsembleStrategy::ConfidenceWeighted),
            )
            .await
            .unwrap();
        assert_eq!(weighted.source, PredictionSource::Ensemble);
        assert!((weighted.value - 0.7).abs() < 1e-9);

        let average = f
            .router
            .route(
                "quality",
                &PredictionRequest::new(payload).with_strategy(EnsembleStrategy::SimpleAverage),
            )
            .await
            .unwrap();
        assert_eq!(average.source, PredictionSource::Cache);
        assert!((average.value - 0.6).abs() < 1e-9);
        assert_eq!(f.alpha.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_uses_survivor() {
        let f = fixture(false);
        f.beta.set_failing(true);
        let req = PredictionRequest::new(json!(1));
        let answer = f.router.route("quality", &req).await.unwrap();
        assert_eq!(answer.source, PredictionSource::Model);
        assert!((answer.value - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_fallback_then_no_prediction() {
        let f = fixture(true);
        f.alpha.set_failing(true);
        f.beta.set_failing(true);
        let answer = f
            .router
            .route("quality", &PredictionRequest::new(json!(2)))
            .await
            .unwrap();
        assert_eq!(answer.source, PredictionSource::Fallback);

        let g = fixture(false);
        g.alpha.set_failing(true);
        g.beta.set_failing(true);
        let err = g
            .router
            .route("quality", &PredictionRequest::new(json!(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::NoPrediction { .. }));
        assert_eq!(g.router.monitor().model_stats("quality").unwrap().errors, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_backend() {
        let f = fixture(false);
        f.beta.set_failing(true);
        for i in 0..4 {
            let _ = f.router.route("quality", &PredictionRequest::new(json!(i))).await;
        }
        let calls = f.beta.calls();
        let _ = f.router.route("quality", &PredictionRequest::new(json!(99))).await;
        assert_eq!(f.beta.calls(), calls);
    }
}
