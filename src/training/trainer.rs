//! Trainer extension point, evaluation metrics, and the shipped calibration
//! trainer.
//!
//! Backends are opaque, so the shipped [`CalibrationTrainer`] learns a linear
//! correction `actual ≈ slope · predicted + intercept` on top of the
//! incumbent's own outputs. Anything smarter plugs in through [`Trainer`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::dataset::LabeledExample;
use super::TrainingError;
use crate::backend::{Predictor, RawPrediction};
use crate::{PredictionRequest, ServingError};

/// Quality of a model on a labeled set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    /// Mean absolute error.
    pub mae: f64,
    /// Root mean squared error.
    pub rmse: f64,
    /// Share of examples with `|predicted - actual| <= tolerance`.
    pub accuracy: f64,
    /// Examples scored.
    pub samples: usize,
}

impl ModelMetrics {
    /// Score `(predicted, actual)` pairs. `None` for an empty input.
    pub fn from_pairs<I>(pairs: I, tolerance: f64) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let (mut n, mut abs, mut sq, mut hits) = (0usize, 0.0, 0.0, 0usize);
        for (predicted, actual) in pairs {
            let err = (predicted - actual).abs();
            n += 1;
            abs += err;
            sq += err * err;
            if err <= tolerance + 1e-12 {
                hits += 1;
            }
        }
        (n > 0).then(|| Self {
            mae: abs / n as f64,
            rmse: (sq / n as f64).sqrt(),
            accuracy: hits as f64 / n as f64,
            samples: n,
        })
    }
}

/// A trained model, serializable for the artifact store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Trainer kind that produced it.
    pub kind: String,
    /// Lineage it belongs to.
    pub lineage: String,
    /// Trainer-specific parameters.
    pub params: serde_json::Value,
    /// Examples it was fitted on.
    pub trained_on: usize,
    /// Fit time.
    pub created_at: DateTime<Utc>,
}

/// Pluggable learning algorithm.
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Kind tag written into artifacts.
    fn kind(&self) -> &str;

    /// Fit a model on `train`.
    async fn fit(&self, lineage: &str, train: &[LabeledExample]) -> Result<ModelArtifact, TrainingError>;

    /// Candidate output for an example whose incumbent output was `base`.
    fn apply(&self, artifact: &ModelArtifact, base: f64) -> Result<f64, TrainingError>;

    /// A serving predictor for `artifact` stacked on `base`.
    fn load(
        &self,
        artifact: &ModelArtifact,
        base: Arc<dyn Predictor>,
    ) -> Result<Arc<dyn Predictor>, TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Calibration {
    slope: f64,
    intercept: f64,
}

impl Calibration {
    fn from_artifact(artifact: &ModelArtifact) -> Result<Self, TrainingError> {
        serde_json::from_value(artifact.params.clone())
            .map_err(|e| TrainingError::Trainer(format!("bad calibration params: {e}")))
    }

    fn apply(&self, base: f64) -> f64 {
        (self.slope * base + self.intercept).clamp(0.0, 1.0)
    }
}

/// Least-squares linear calibration.
#[derive(Debug, Clone)]
pub struct CalibrationTrainer {
    min_examples: usize,
}

impl Default for CalibrationTrainer {
    fn default() -> Self {
        Self { min_examples: 2 }
    }
}

impl CalibrationTrainer {
    /// Trainer that refuses fewer than `min_examples` training examples.
    pub fn new(min_examples: usize) -> Self {
        Self {
            min_examples: min_examples.max(1),
        }
    }
}

#[async_trait]
impl Trainer for CalibrationTrainer {
    fn kind(&self) -> &str {
        "linear-calibration"
    }

    async fn fit(&self, lineage: &str, train: &[LabeledExample]) -> Result<ModelArtifact, TrainingError> {
        if train.len() < self.min_examples {
            return Err(TrainingError::InsufficientData {
                lineage: lineage.to_string(),
                have: train.len(),
                need: self.min_examples,
            });
        }
        let n = train.len() as f64;
        let mean_x = train.iter().map(|e| e.predicted).sum::<f64>() / n;
        let mean_y = train.iter().map(|e| e.actual).sum::<f64>() / n;
        let (cov, var) = train.iter().fold((0.0, 0.0), |(c, v), e| {
            let dx = e.predicted - mean_x;
            (c + dx * (e.actual - mean_y), v + dx * dx)
        });
        // Constant inputs carry no slope information: shift only.
        let calibration = if var < 1e-12 {
            Calibration {
                slope: 1.0,
                intercept: mean_y - mean_x,
            }
        } else {
            let slope = cov / var;
            Calibration {
                slope,
                intercept: mean_y - slope * mean_x,
            }
        };
        if !calibration.slope.is_finite() || !calibration.intercept.is_finite() {
            return Err(TrainingError::Trainer("non-finite calibration".to_string()));
        }
        Ok(ModelArtifact {
            kind: self.kind().to_string(),
            lineage: lineage.to_string(),
            params: serde_json::to_value(calibration)
                .map_err(|e| TrainingError::Trainer(e.to_string()))?,
            trained_on: train.len(),
            created_at: Utc::now(),
        })
    }

    fn apply(&self, artifact: &ModelArtifact, base: f64) -> Result<f64, TrainingError> {
        Ok(Calibration::from_artifact(artifact)?.apply(base))
    }

    fn load(
        &self,
        artifact: &ModelArtifact,
        base: Arc<dyn Predictor>,
    ) -> Result<Arc<dyn Predictor>, TrainingError> {
        let c = Calibration::from_artifact(artifact)?;
        Ok(Arc::new(CalibratedPredictor {
            base,
            slope: c.slope,
            intercept: c.intercept,
        }))
    }
}

/// Serving wrapper applying a trained calibration to a base backend.
pub struct CalibratedPredictor {
    base: Arc<dyn Predictor>,
    slope: f64,
    intercept: f64,
}

impl CalibratedPredictor {
    /// Wrap `base` with `value' = clamp(slope · value + intercept)`.
    pub fn new(base: Arc<dyn Predictor>, slope: f64, intercept: f64) -> Self {
        Self {
            base,
            slope,
            intercept,
        }
    }
}

#[async_trait]
impl Predictor for CalibratedPredictor {
    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, ServingError> {
        let raw = self.base.predict(request).await?;
        Ok(RawPrediction::new(
            (self.slope * raw.value + self.intercept).clamp(0.0, 1.0),
            raw.confidence,
        ))
    }
}
