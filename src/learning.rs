//! # Stage: Learning Loop
//!
//! ## Responsibility
//! Turn each reconciled outcome into learning signal: ensemble weight
//! updates, labeled examples for the training pipeline, live accuracy for
//! rollouts, and drift observations.
//!
//! ## Guarantees
//! - Learning follows the reconciled actual: when a higher-priority source
//!   revises a label, the training example and the live and drift windows are
//!   relabelled in place, and the ensemble takes a further step toward the
//!   corrected value
//! - A rollback caused by an outcome retires the pipeline cycle that produced it
//! - A drift alert starts an out-of-cycle training run in the background
//! - Failures here are logged and never reach the request path
//!
//! ## NOT Responsible For
//! - Reconciling feedback (that belongs to `feedback`)
//! - Deciding promotions (that belongs to `deployment`)

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deployment::{DeploymentEvent, DeploymentManager};
use crate::ensemble::EnsemblePredictor;
use crate::feedback::{OutcomeEvent, OutcomeSink};
use crate::metrics;
use crate::training::{LabeledExample, TrainingError, TrainingPipeline};

/// Counters of the learning loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LearningStats {
    /// Outcomes received.
    pub outcomes: u64,
    /// Outcomes that revised an earlier label.
    pub revisions: u64,
    /// Ensemble updates applied.
    pub ensemble_updates: u64,
    /// Labeled examples handed to the pipeline.
    pub examples: u64,
    /// Rollbacks triggered by live outcomes.
    pub rollbacks: u64,
    /// Drift alerts raised.
    pub drift_alerts: u64,
    /// Outcomes with no member predictions.
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    outcomes: AtomicU64,
    revisions: AtomicU64,
    ensemble_updates: AtomicU64,
    examples: AtomicU64,
    rollbacks: AtomicU64,
    drift_alerts: AtomicU64,
    skipped: AtomicU64,
}

/// Outcome sink that drives ensemble, training and deployment.
pub struct LearningLoop {
    ensemble: Arc<EnsemblePredictor>,
    pipeline: Arc<TrainingPipeline>,
    deployment: Arc<DeploymentManager>,
    counters: Counters,
}

impl LearningLoop {
    /// Loop over the shared components.
    pub fn new(
        ensemble: Arc<EnsemblePredictor>,
        pipeline: Arc<TrainingPipeline>,
        deployment: Arc<DeploymentManager>,
    ) -> Self {
        Self {
            ensemble,
            pipeline,
            deployment,
            counters: Counters::default(),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LearningStats {
        LearningStats {
            outcomes: self.counters.outcomes.load(Ordering::Relaxed),
            revisions: self.counters.revisions.load(Ordering::Relaxed),
            ensemble_updates: self.counters.ensemble_updates.load(Ordering::Relaxed),
            examples: self.counters.examples.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
            drift_alerts: self.counters.drift_alerts.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    fn spawn_drift_retrain(&self, lineage: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lineage = %lineage, "no runtime for drift retraining");
            return;
        };
        let pipeline = Arc::clone(&self.pipeline);
        handle.spawn(async move {
            match pipeline.force_training(&lineage, "drift").await {
                Ok(report) => info!(
                    lineage = %lineage,
                    version = %report.version,
                    outcome = ?report.outcome,
                    "drift retraining finished"
                ),
                Err(TrainingError::AlreadyTraining(_)) => {}
                Err(e) => warn!(lineage = %lineage, error = %e, "drift retraining failed"),
            }
        });
    }
}

#[async_trait]
impl OutcomeSink for LearningLoop {
    async fn on_outcome(&self, event: &OutcomeEvent) {
        self.counters.outcomes.fetch_add(1, Ordering::Relaxed);
        if event.is_revision() {
            self.counters.revisions.fetch_add(1, Ordering::Relaxed);
        }
        let record = &event.record;
        if record.members.is_empty() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self
            .ensemble
            .update_with_feedback(&record.members, event.actual, &record.context)
        {
            Ok(applied) => {
                self.counters.ensemble_updates.fetch_add(1, Ordering::Relaxed);
                let ids: Vec<&str> = record.members.iter().map(|m| m.model_id.as_str()).collect();
                for (id, w) in ids.iter().zip(self.ensemble.normalized_weights(&ids)) {
                    metrics::set_ensemble_weight(id, w);
                }
                debug!(
                    prediction_id = %record.id,
                    ensemble_error = applied.ensemble_error,
                    "ensemble updated"
                );
            }
            Err(e) => warn!(prediction_id = %record.id, error = %e, "ensemble update rejected"),
        }

        for member in &record.members {
            if member.version.is_empty()
                || self.deployment.descriptor(&member.model_id, &member.version).is_none()
            {
                continue;
            }
            let lineage = member.model_id.as_str();
            let example = LabeledExample::new(
                record.id.clone(),
                lineage,
                member.version.clone(),
                member.value,
                event.actual,
            )
            .with_features(record.context.clone());
            self.pipeline.add_example(example);
            self.counters.examples.fetch_add(1, Ordering::Relaxed);

            let live = match event.previous {
                Some(previous) => self.deployment.revise_live_outcome(
                    lineage,
                    &member.version,
                    member.value,
                    previous,
                    event.actual,
                ),
                None => self
                    .deployment
                    .record_live_outcome(lineage, &member.version, member.value, event.actual),
            };
            if let Some(DeploymentEvent::RolledBack { version, .. }) = live {
                self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
                self.pipeline.on_rollback(lineage, &version);
            }

            let abs_error = (member.value - event.actual).abs();
            let drift = match event.previous {
                Some(previous) => {
                    self.deployment
                        .revise_drift(lineage, (member.value - previous).abs(), abs_error)
                }
                None => self.deployment.observe_drift(lineage, abs_error),
            };
            if let Some(alert) = drift {
                self.counters.drift_alerts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    lineage = lineage,
                    baseline_mae = alert.baseline_mae,
                    live_mae = alert.live_mae,
                    "drift alert, forcing retraining"
                );
                self.spawn_drift_retrain(lineage.to_string());
            }
        }
    }
}
