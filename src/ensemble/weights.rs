//! Per-member global weights learned from reconciled outcomes.
//!
//! Each observation moves a member's weight toward `1 / (1 + |error|)` by
//! exponential decay, so recent errors dominate. Updates are atomic per member
//! (DashMap entry lock); members never block each other.

use dashmap::DashMap;
use std::collections::BTreeMap;

/// Weight given to a member that has never been scored.
pub const INITIAL_WEIGHT: f64 = 1.0;

/// Concurrency-safe map of member weights.
pub struct EnsembleWeightState {
    weights: DashMap<String, f64>,
    decay: f64,
}

impl EnsembleWeightState {
    /// State with decay factor `decay` (clamped into `[0, 1)`).
    pub fn new(decay: f64) -> Self {
        Self {
            weights: DashMap::new(),
            decay: if decay.is_finite() {
                decay.clamp(0.0, 0.999_999)
            } else {
                0.9
            },
        }
    }

    /// Raw weight of `model_id`, [`INITIAL_WEIGHT`] if unseen.
    pub fn weight(&self, model_id: &str) -> f64 {
        self.weights
            .get(model_id)
            .map_or(INITIAL_WEIGHT, |w| *w.value())
    }

    /// Fold one absolute error into the member's weight and return the new weight.
    pub fn update(&self, model_id: &str, abs_error: f64) -> f64 {
        let score = 1.0 / (1.0 + abs_error.abs());
        let decay = self.decay;
        let mut entry = self
            .weights
            .entry(model_id.to_string())
            .or_insert(INITIAL_WEIGHT);
        let updated = decay * *entry + (1.0 - decay) * score;
        *entry = updated.max(0.0);
        *entry
    }

    /// Weights of `model_ids` normalised to sum to 1.
    ///
    /// Falls back to equal weights when every raw weight is zero.
    pub fn normalized(&self, model_ids: &[&str]) -> Vec<f64> {
        let raw: Vec<f64> = model_ids.iter().map(|id| self.weight(id)).collect();
        normalize(&raw)
    }

    /// Raw weights of every known member.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.weights
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Replace all weights.
    pub fn restore(&self, weights: &BTreeMap<String, f64>) {
        self.weights.clear();
        for (id, w) in weights {
            if w.is_finite() && *w >= 0.0 {
                self.weights.insert(id.clone(), *w);
            }
        }
    }
}

/// Normalise non-negative weights to sum to 1; equal weights if they sum to 0.
pub fn normalize(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let clean: Vec<f64> = raw
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .collect();
    let sum: f64 = clean.iter().sum();
    if sum <= f64::EPSILON {
        let equal = 1.0 / raw.len() as f64;
        return vec![equal; raw.len()];
    }
    clean.iter().map(|w| w / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_follows_exponential_decay() {
        let state = EnsembleWeightState::new(0.9);
        // error 0 → score 1.0 keeps weight at 1.0
        assert!((state.update("a", 0.0) - 1.0).abs() < 1e-12);
        // error 1 → score 0.5: 0.9 * 1.0 + 0.1 * 0.5
        assert!((state.update("b", 1.0) - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_lower_error_member_gains_relative_weight() {
        let state = EnsembleWeightState::new(0.9);
        for _ in 0..20 {
            state.update("good", 0.05);
            state.update("bad", 0.6);
        }
        let w = state.normalized(&["good", "bad"]);
        assert!(w[0] > w[1]);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_zero_weights_falls_back_to_equal() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.5, 0.5]);
        assert_eq!(normalize(&[f64::NAN, 2.0]), vec![0.0, 1.0]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn test_snapshot_and_restore() {
        let state = EnsembleWeightState::new(0.9);
        state.update("a", 0.3);
        let snap = state.snapshot();
        let other = EnsembleWeightState::new(0.9);
        other.restore(&snap);
        assert_eq!(other.weight("a"), state.weight("a"));
        assert_eq!(other.weight("unknown"), INITIAL_WEIGHT);
    }
}
