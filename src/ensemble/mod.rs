//! # Stage: Ensemble Combination
//!
//! ## Responsibility
//! Combine the raw predictions of a route's members into one answer using a
//! caller-selectable strategy, and improve the combination online from
//! reconciled outcomes without a full retrain.
//!
//! ## Guarantees
//! - Convex: every strategy returns a value within `[min, max]` of its inputs
//! - Never empty: dynamic selection always keeps at least one member
//! - Per-member atomic weight updates; no cross-member lock
//! - Bounded: the feedback history keeps at most `history_limit` records
//!
//! ## NOT Responsible For
//! - Calling backends (that belongs to `routing`)
//! - Deciding when an outcome is final (that belongs to `feedback`)

pub mod stacking;
pub mod strategy;
pub mod weights;

pub use stacking::MetaCombiner;
pub use weights::EnsembleWeightState;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::debug;

use crate::metrics;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors produced by the ensemble.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnsembleError {
    /// No member predictions were supplied.
    #[error("ensemble received no member predictions")]
    Empty,

    /// The ground-truth value was NaN, infinite or outside `[0, 1]`.
    #[error("invalid actual value: {0}")]
    InvalidActual(f64),
}

// ─── Types ───────────────────────────────────────────────────────────────────

/// Combination strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStrategy {
    /// Mean of member values.
    SimpleAverage,
    /// Weight proportional to member confidence.
    ConfidenceWeighted,
    /// Relative global weight × confidence, thresholded, then voted.
    DynamicSelection,
    /// Online meta-combiner.
    Stacking,
}

impl EnsembleStrategy {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsembleStrategy::SimpleAverage => "simple_average",
            EnsembleStrategy::ConfidenceWeighted => "confidence_weighted",
            EnsembleStrategy::DynamicSelection => "dynamic_selection",
            EnsembleStrategy::Stacking => "stacking",
        }
    }
}

/// One member's raw answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberPrediction {
    /// Member model (lineage) id; the key for ensemble weights.
    pub model_id: String,
    /// Version of the lineage that answered.
    #[serde(default)]
    pub version: String,
    /// Registry key of the backend that answered.
    #[serde(default)]
    pub backend: String,
    /// Predicted score.
    pub value: f64,
    /// Member confidence.
    pub confidence: f64,
}

impl MemberPrediction {
    /// Member prediction without version/backend metadata.
    pub fn new(model_id: impl Into<String>, value: f64, confidence: f64) -> Self {
        Self {
            model_id: model_id.into(),
            version: String::new(),
            backend: String::new(),
            value,
            confidence,
        }
    }

    /// Attach the serving version and backend key.
    pub fn with_source(mut self, version: impl Into<String>, backend: impl Into<String>) -> Self {
        self.version = version.into();
        self.backend = backend.into();
        self
    }
}

/// Output of [`EnsemblePredictor::combine`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedPrediction {
    /// Combined score.
    pub value: f64,
    /// Combined confidence.
    pub confidence: f64,
    /// Strategy that produced this answer.
    pub strategy: EnsembleStrategy,
    /// Weight given to each member, input order.
    pub weights: Vec<(String, f64)>,
}

/// Ensemble tuning (`[ensemble]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EnsembleSettings {
    /// Strategy used when neither route nor request chooses one.
    pub default_strategy: EnsembleStrategy,
    /// Exponential decay applied to member weights on each outcome.
    pub decay: f64,
    /// Minimum dynamic-selection score a member needs to vote.
    pub selection_threshold: f64,
    /// Stacking learning rate.
    pub learning_rate: f64,
    /// Feedback records kept for statistics.
    pub history_limit: usize,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            default_strategy: EnsembleStrategy::DynamicSelection,
            decay: 0.9,
            selection_threshold: 0.3,
            learning_rate: 0.5,
            history_limit: 1000,
        }
    }
}

/// One processed outcome.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    /// Reconciled ground truth.
    pub actual: f64,
    /// Error of the ensemble answer under the default strategy, before the update.
    pub ensemble_error: f64,
    /// Absolute error per member.
    pub member_errors: Vec<(String, f64)>,
    /// Caller-supplied context.
    pub context: serde_json::Value,
    /// When the outcome was applied.
    pub recorded_at: DateTime<Utc>,
}

/// Operational view of the ensemble.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleStatistics {
    /// Raw global weights.
    pub weights: BTreeMap<String, f64>,
    /// Global weights normalised over all known members.
    pub normalized_weights: BTreeMap<String, f64>,
    /// Stacking meta-weights.
    pub meta_weights: BTreeMap<String, f64>,
    /// Records in the feedback history.
    pub history_size: usize,
    /// Mean ensemble error over the history.
    pub mean_error: Option<f64>,
}

/// Serializable weight state for disaster recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnsembleSnapshot {
    /// Global member weights.
    pub weights: BTreeMap<String, f64>,
    /// Stacking meta-weights.
    pub meta_weights: BTreeMap<String, f64>,
}

// ─── Predictor ───────────────────────────────────────────────────────────────

/// Combines member predictions and learns from outcomes.
pub struct EnsemblePredictor {
    settings: EnsembleSettings,
    weights: EnsembleWeightState,
    meta: MetaCombiner,
    history: Mutex<VecDeque<FeedbackRecord>>,
}

impl EnsemblePredictor {
    /// Fresh ensemble with all members at the initial weight.
    pub fn new(settings: EnsembleSettings) -> Self {
        Self {
            weights: EnsembleWeightState::new(settings.decay),
            meta: MetaCombiner::new(settings.learning_rate),
            history: Mutex::new(VecDeque::new()),
            settings,
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &EnsembleSettings {
        &self.settings
    }

    /// Global weight state.
    pub fn weight_state(&self) -> &EnsembleWeightState {
        &self.weights
    }

    /// Combine `predictions` with `strategy` (or the default strategy).
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::Empty`] when `predictions` is empty.
    pub fn combine(
        &self,
        predictions: &[MemberPrediction],
        strategy: Option<EnsembleStrategy>,
    ) -> Result<CombinedPrediction, EnsembleError> {
        if predictions.is_empty() {
            return Err(EnsembleError::Empty);
        }
        let strategy = strategy.unwrap_or(self.settings.default_strategy);

        let combination = match strategy {
            EnsembleStrategy::SimpleAverage => strategy::simple_average(predictions),
            EnsembleStrategy::ConfidenceWeighted => strategy::confidence_weighted(predictions),
            EnsembleStrategy::DynamicSelection => {
                let global: Vec<f64> = predictions
                    .iter()
                    .map(|p| self.weights.weight(&p.model_id))
                    .collect();
                strategy::dynamic_selection(predictions, &global, self.settings.selection_threshold)
                    .combination
            }
            EnsembleStrategy::Stacking => {
                let meta = self.meta.weights_for(predictions);
                strategy::weighted(predictions, &meta)
            }
        };

        Ok(CombinedPrediction {
            value: combination.value,
            confidence: combination.confidence,
            strategy,
            weights: predictions
                .iter()
                .zip(combination.weights)
                .map(|(p, w)| (p.model_id.clone(), w))
                .collect(),
        })
    }

    /// Learn from one reconciled outcome.
    ///
    /// Every member's global weight decays toward `1 / (1 + |error|)`, the
    /// stacking meta-weights take one step, and the record joins the bounded
    /// history.
    ///
    /// # Errors
    ///
    /// - [`EnsembleError::Empty`] if `predictions` is empty.
    /// - [`EnsembleError::InvalidActual`] if `actual` is not a finite value in `[0, 1]`.
    pub fn update_with_feedback(
        &self,
        predictions: &[MemberPrediction],
        actual: f64,
        context: &serde_json::Value,
    ) -> Result<FeedbackRecord, EnsembleError> {
        if !actual.is_finite() || !(0.0..=1.0).contains(&actual) {
            return Err(EnsembleError::InvalidActual(actual));
        }
        let before = self.combine(predictions, None)?;

        let member_errors: Vec<(String, f64)> = predictions
            .iter()
            .map(|p| {
                let err = (p.value - actual).abs();
                self.weights.update(&p.model_id, err);
                (p.model_id.clone(), err)
            })
            .collect();
        self.meta.update(predictions, actual);

        let record = FeedbackRecord {
            actual,
            ensemble_error: (before.value - actual).abs(),
            member_errors,
            context: context.clone(),
            recorded_at: Utc::now(),
        };

        {
            let mut history = self.history.lock();
            history.push_back(record.clone());
            while history.len() > self.settings.history_limit.max(1) {
                history.pop_front();
            }
        }

        let ids: Vec<&str> = predictions.iter().map(|p| p.model_id.as_str()).collect();
        for (id, w) in ids.iter().zip(self.weights.normalized(&ids)) {
            metrics::set_ensemble_weight(id, w);
        }
        debug!(
            actual = actual,
            ensemble_error = record.ensemble_error,
            members = predictions.len(),
            "ensemble weights updated"
        );
        Ok(record)
    }

    /// Normalised global weights of `model_ids`.
    pub fn normalized_weights(&self, model_ids: &[&str]) -> Vec<f64> {
        self.weights.normalized(model_ids)
    }

    /// Current weights, history size and mean error.
    pub fn statistics(&self) -> EnsembleStatistics {
        let weights = self.weights.snapshot();
        let ids: Vec<&str> = weights.keys().map(String::as_str).collect();
        let normalized_weights = ids
            .iter()
            .zip(self.weights.normalized(&ids))
            .map(|(id, w)| (id.to_string(), w))
            .collect();
        let history = self.history.lock();
        let mean_error = if history.is_empty() {
            None
        } else {
            Some(history.iter().map(|r| r.ensemble_error).sum::<f64>() / history.len() as f64)
        };
        EnsembleStatistics {
            weights,
            normalized_weights,
            meta_weights: self.meta.snapshot(),
            history_size: history.len(),
            mean_error,
        }
    }

    /// Capture weight state.
    pub fn export_state(&self) -> EnsembleSnapshot {
        EnsembleSnapshot {
            weights: self.weights.snapshot(),
            meta_weights: self.meta.snapshot(),
        }
    }

    /// Replace weight state (history is not restored).
    pub fn restore_state(&self, snapshot: &EnsembleSnapshot) {
        self.weights.restore(&snapshot.weights);
        self.meta.restore(&snapshot.meta_weights);
    }
}
