//! Online meta-combiner for the stacking strategy.
//!
//! Multiplicative-weights update: after each reconciled outcome every
//! member's meta-weight is multiplied by `exp(-η · |error|)` and the vector is
//! rescaled so its largest entry is 1. The combination is a convex
//! combination of member values. State is independent of
//! [`super::weights::EnsembleWeightState`].

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::weights::normalize;
use super::MemberPrediction;

const MIN_META_WEIGHT: f64 = 1e-6;

/// Meta-weights for stacking.
pub struct MetaCombiner {
    weights: Mutex<HashMap<String, f64>>,
    learning_rate: f64,
}

impl MetaCombiner {
    /// Combiner with learning rate `η`.
    pub fn new(learning_rate: f64) -> Self {
        Self {
            weights: Mutex::new(HashMap::new()),
            learning_rate: if learning_rate.is_finite() && learning_rate > 0.0 {
                learning_rate
            } else {
                0.5
            },
        }
    }

    /// Normalised meta-weights for `predictions` (unseen members get 1.0 before
    /// normalisation).
    pub fn weights_for(&self, predictions: &[MemberPrediction]) -> Vec<f64> {
        let weights = self.weights.lock();
        let raw: Vec<f64> = predictions
            .iter()
            .map(|p| weights.get(&p.model_id).copied().unwrap_or(1.0))
            .collect();
        normalize(&raw)
    }

    /// Apply one multiplicative-weights step.
    pub fn update(&self, predictions: &[MemberPrediction], actual: f64) {
        let mut weights = self.weights.lock();
        for p in predictions {
            let w = weights.entry(p.model_id.clone()).or_insert(1.0);
            let err = (p.value - actual).abs();
            *w *= (-self.learning_rate * err).exp();
        }
        let max = weights.values().copied().fold(0.0f64, f64::max);
        if max > 0.0 {
            for w in weights.values_mut() {
                *w = (*w / max).max(MIN_META_WEIGHT);
            }
        }
    }

    /// Raw meta-weights.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.weights
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Replace all meta-weights.
    pub fn restore(&self, snapshot: &BTreeMap<String, f64>) {
        let mut weights = self.weights.lock();
        weights.clear();
        for (k, v) in snapshot {
            if v.is_finite() && *v > 0.0 {
                weights.insert(k.clone(), *v);
            }
        }
    }
}
