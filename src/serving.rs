//! # Stage: Serving Core
//!
//! ## Responsibility
//! Build one instance of every component from a [`ServingConfig`], wire the
//! learning loop into the feedback collector, and own the background tasks
//! (feedback flusher, recovery snapshots).
//!
//! ## Guarantees
//! - Construction validates the config before anything is started
//! - Every configured backend is an active lineage at 100% traffic
//! - Background tasks stop on the shared shutdown signal, flushing first
//!
//! ## NOT Responsible For
//! - HTTP (that belongs to `web_api`)
//! - Process setup (that belongs to the binary)

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{HttpPredictor, Predictor, PredictorRegistry, StaticPredictor};
use crate::cache::{CacheStats, MultiTierCache};
use crate::config::{validation, BackendKind, ServingConfig};
use crate::deployment::{DeploymentManager, LineageStatus};
use crate::ensemble::{EnsemblePredictor, EnsembleStatistics};
use crate::feedback::{FeedbackCollector, MemoryStore, PredictionStore};
use crate::learning::{LearningLoop, LearningStats};
use crate::resilience::{BreakerRegistry, CircuitBreakerStats, DisasterRecovery};
use crate::routing::{ModelRequestStats, RequestMonitor, RequestRouter, RouteSpec, RoutingTable, RoutingTableHandle};
use crate::training::{ArtifactStore, CalibrationTrainer, PipelineSnapshot, Trainer, TrainingPipeline};
use crate::{PredictionRequest, RoutedPrediction, ServingError};

/// Aggregate view served by `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServingStatus {
    /// Service name.
    pub service: String,
    /// Routable model ids.
    pub models: Vec<String>,
    /// Routing table generation.
    pub table_generation: u64,
    /// Per-lineage deployment state.
    pub deployments: BTreeMap<String, LineageStatus>,
    /// Per-lineage pipeline state.
    pub pipelines: BTreeMap<String, PipelineSnapshot>,
    /// Breakers seen so far.
    pub breakers: Vec<CircuitBreakerStats>,
    /// Cache counters.
    pub cache: CacheStats,
    /// Ensemble weights.
    pub ensemble: EnsembleStatistics,
    /// Per-model request counters.
    pub requests: Vec<ModelRequestStats>,
    /// Learning loop counters.
    pub learning: LearningStats,
    /// Writes waiting for the feedback store.
    pub feedback_queue_depth: usize,
}

/// Handles of the background tasks started by [`ServingCore::start_background`].
#[derive(Debug)]
pub struct BackgroundTasks {
    /// Feedback flusher.
    pub flusher: JoinHandle<()>,
    /// Periodic recovery snapshots, when enabled.
    pub recovery: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Wait for every task to finish.
    pub async fn join(self) {
        if let Err(e) = self.flusher.await {
            warn!(error = %e, "feedback flusher panicked");
        }
        if let Some(recovery) = self.recovery {
            if let Err(e) = recovery.await {
                warn!(error = %e, "recovery task panicked");
            }
        }
    }
}

/// Every component of one serving instance.
pub struct ServingCore {
    /// Config the core was built from.
    pub config: ServingConfig,
    /// Backend predictors by registry key.
    pub registry: Arc<PredictorRegistry>,
    /// Routing table shared by router and deployment.
    pub table: Arc<RoutingTableHandle>,
    /// Per-backend breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Prediction cache.
    pub cache: Arc<MultiTierCache>,
    /// Ensemble combination and weights.
    pub ensemble: Arc<EnsemblePredictor>,
    /// Prediction and outcome capture.
    pub feedback: Arc<FeedbackCollector>,
    /// Request tracking.
    pub monitor: Arc<RequestMonitor>,
    /// Model versions and rollouts.
    pub deployment: Arc<DeploymentManager>,
    /// Trained artifacts.
    pub artifacts: Arc<ArtifactStore>,
    /// Retraining state machine.
    pub pipeline: Arc<TrainingPipeline>,
    /// Outcome sink feeding ensemble, training and deployment.
    pub learning: Arc<LearningLoop>,
    /// Snapshots and restore.
    pub recovery: Arc<DisasterRecovery>,
    /// Request entry point.
    pub router: RequestRouter,
}

impl std::fmt::Debug for ServingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingCore")
            .field("service", &self.config.service.name)
            .field("backends", &self.registry.keys())
            .finish()
    }
}

fn predictor_for(name: &str, kind: &BackendKind) -> Arc<dyn Predictor> {
    match kind {
        BackendKind::Static { value, confidence } => {
            Arc::new(StaticPredictor::new(name, *value, *confidence))
        }
        BackendKind::Http {
            url,
            api_key,
            timeout_ms,
        } => {
            let mut predictor = HttpPredictor::new(name, url.clone());
            if let Some(key) = api_key {
                predictor = predictor.with_api_key(key.clone());
            }
            if let Some(ms) = timeout_ms {
                predictor = predictor.with_timeout(Duration::from_millis(*ms));
            }
            Arc::new(predictor)
        }
    }
}

impl ServingCore {
    /// Build a core with an in-memory prediction store and the calibration
    /// trainer.
    ///
    /// # Errors
    ///
    /// [`ServingError::ConfigError`] if the config fails validation or a
    /// backend cannot be activated.
    pub async fn from_config(config: ServingConfig) -> Result<Self, ServingError> {
        Self::build(
            config,
            Arc::new(PredictorRegistry::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(CalibrationTrainer::default()),
        )
        .await
    }

    /// Build a core over caller-supplied parts. Backends already present in
    /// `registry` under `{name}@{version}` are kept instead of being built
    /// from the config.
    ///
    /// # Errors
    ///
    /// As [`Self::from_config`].
    pub async fn build(
        config: ServingConfig,
        registry: Arc<PredictorRegistry>,
        store: Arc<dyn PredictionStore>,
        trainer: Arc<dyn Trainer>,
    ) -> Result<Self, ServingError> {
        validation::validate(&config).map_err(|errors| {
            ServingError::ConfigError(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        for backend in &config.backends {
            let key = backend.key();
            if !registry.contains(&key) {
                registry.register(key, predictor_for(&backend.name, &backend.kind));
            }
        }

        let mut routes = RoutingTable::new();
        for (model_id, route) in &config.routes {
            let mut spec = RouteSpec::new(route.members.iter().cloned());
            if let Some(fallback) = route.fallback.as_deref().and_then(|f| config.backend(f)) {
                spec = spec.with_fallback(fallback.key());
            }
            if let Some(strategy) = route.strategy {
                spec = spec.with_strategy(strategy);
            }
            routes = routes.with_route(model_id.clone(), spec);
        }
        let table = Arc::new(RoutingTableHandle::new(routes));

        let deployment = Arc::new(DeploymentManager::new(
            config.deployment.clone(),
            Arc::clone(&table),
            Arc::clone(&registry),
        ));
        for backend in &config.backends {
            deployment
                .register_active(&backend.name, &backend.version, &backend.key(), None)
                .map_err(|e| ServingError::ConfigError(format!("backend '{}': {e}", backend.name)))?;
        }

        let breakers = Arc::new(BreakerRegistry::new(config.resilience.clone()));
        let cache = Arc::new(MultiTierCache::from_settings(config.cache.clone()).await);
        let ensemble = Arc::new(EnsemblePredictor::new(config.ensemble.clone()));
        let feedback = Arc::new(FeedbackCollector::new(store, config.feedback.clone()));
        let monitor = Arc::new(RequestMonitor::new());

        let artifacts = Arc::new(match &config.training.artifact_dir {
            Some(dir) => ArtifactStore::in_dir(dir.clone()),
            None => ArtifactStore::in_memory(),
        });
        let pipeline = Arc::new(TrainingPipeline::new(
            config.training.clone(),
            trainer,
            Arc::clone(&artifacts),
            Arc::clone(&deployment),
            Arc::clone(&registry),
        ));
        let learning = Arc::new(LearningLoop::new(
            Arc::clone(&ensemble),
            Arc::clone(&pipeline),
            Arc::clone(&deployment),
        ));
        feedback.add_sink(Arc::clone(&learning) as Arc<dyn crate::feedback::OutcomeSink>);

        let recovery = Arc::new(DisasterRecovery::new(
            Arc::clone(&deployment),
            Arc::clone(&ensemble),
            Arc::clone(&artifacts),
            Arc::clone(&table),
            config.recovery.clone(),
        ));

        let router = RequestRouter::new(
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&cache),
            Arc::clone(&ensemble),
            Arc::clone(&feedback),
            Arc::clone(&monitor),
            config.routing.clone(),
        );

        let problems = table.load().problems();
        for problem in &problems {
            warn!(problem = %problem, "routing table problem");
        }

        info!(
            service = %config.service.name,
            backends = config.backends.len(),
            routes = config.routes.len(),
            cache_tiers = ?cache.tier_names(),
            "serving core ready"
        );

        Ok(Self {
            config,
            registry,
            table,
            breakers,
            cache,
            ensemble,
            feedback,
            monitor,
            deployment,
            artifacts,
            pipeline,
            learning,
            recovery,
            router,
        })
    }

    /// Route one request; see [`RequestRouter::route`].
    ///
    /// # Errors
    ///
    /// As [`RequestRouter::route`].
    pub async fn predict(
        &self,
        model_id: &str,
        request: &PredictionRequest,
    ) -> Result<RoutedPrediction, ServingError> {
        self.router.route(model_id, request).await
    }

    /// Reload persisted recovery snapshots and start the feedback flusher and,
    /// when enabled, periodic snapshots. Both stop when `shutdown` flips to
    /// `true`.
    pub async fn start_background(&self, shutdown: watch::Receiver<bool>) -> BackgroundTasks {
        if self.config.recovery.dir.is_some() {
            match self.recovery.load_persisted().await {
                Ok(n) if n > 0 => info!(snapshots = n, "recovery snapshots reloaded"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not reload recovery snapshots"),
            }
        }
        let flusher = self.feedback.spawn_flusher(shutdown.clone());
        let recovery = self
            .config
            .recovery
            .enabled
            .then(|| self.recovery.spawn_periodic(shutdown));
        BackgroundTasks { flusher, recovery }
    }

    /// Aggregate status of every component.
    pub fn status(&self) -> ServingStatus {
        let table = self.table.load();
        ServingStatus {
            service: self.config.service.name.clone(),
            models: table.model_ids(),
            table_generation: table.generation(),
            deployments: self.deployment.status(),
            pipelines: self.pipeline.snapshots(),
            breakers: self.breakers.snapshot(),
            cache: self.cache.stats(),
            ensemble: self.ensemble.statistics(),
            requests: self.monitor.snapshot(),
            learning: self.learning.stats(),
            feedback_queue_depth: self.feedback.queue().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, RouteConfig};
    use serde_json::json;

    fn config() -> ServingConfig {
        let mut config = ServingConfig::default();
        config.recovery.enabled = false;
        config.backends = vec![
            BackendConfig {
                name: "low".into(),
                version: "v1".into(),
                kind: BackendKind::Static {
                    value: 0.2,
                    confidence: 0.9,
                },
            },
            BackendConfig {
                name: "high".into(),
                version: "v1".into(),
                kind: BackendKind::Static {
                    value: 0.8,
                    confidence: 0.9,
                },
            },
        ];
        config.routes.insert(
            "quality".into(),
            RouteConfig {
                members: vec!["low".into(), "high".into()],
                fallback: Some("low".into()),
                strategy: None,
            },
        );
        config
    }

    #[tokio::test]
    async fn test_from_config_activates_every_backend() {
        let core = ServingCore::from_config(config()).await.unwrap();
        let status = core.status();
        assert_eq!(status.models, vec!["quality".to_string()]);
        assert_eq!(status.deployments.len(), 2);
        assert_eq!(
            status.deployments["low"].active_version.as_deref(),
            Some("v1")
        );
        assert!(core.table.load().problems().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut bad = config();
        bad.training.threshold = 0;
        let err = ServingCore::from_config(bad).await.unwrap_err();
        assert!(matches!(err, ServingError::ConfigError(msg) if msg.contains("training.threshold")));
    }

    #[tokio::test]
    async fn test_predict_combines_members() {
        let core = ServingCore::from_config(config()).await.unwrap();
        let out = core
            .predict("quality", &PredictionRequest::new(json!({"text": "hi"})))
            .await
            .unwrap();
        assert!((out.value - 0.5).abs() < 1e-9);
        assert_eq!(out.members.len(), 2);
        assert_eq!(core.status().requests.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_predictor_is_kept() {
        let registry = Arc::new(PredictorRegistry::new());
        let custom = Arc::new(StaticPredictor::new("low", 0.4, 0.9));
        registry.register("low@v1", custom.clone() as Arc<dyn Predictor>);
        let core = ServingCore::build(
            config(),
            registry,
            Arc::new(MemoryStore::new()),
            Arc::new(CalibrationTrainer::default()),
        )
        .await
        .unwrap();
        core.predict("quality", &PredictionRequest::new(json!("x")))
            .await
            .unwrap();
        assert_eq!(custom.calls(), 1);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let core = ServingCore::from_config(config()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let tasks = core.start_background(rx).await;
        assert!(tasks.recovery.is_none());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.join())
            .await
            .unwrap();
    }
}
