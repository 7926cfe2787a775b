//! Pure combination rules.
//!
//! Every rule produces non-negative weights summing to 1, so the combined value
//! is a convex combination of member values. The result is additionally
//! clamped to `[min, max]` of the inputs to absorb rounding.

use super::weights::normalize;
use super::MemberPrediction;

/// Weights chosen by a rule plus the resulting value and confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination {
    /// Combined value.
    pub value: f64,
    /// Weighted mean of member confidences.
    pub confidence: f64,
    /// Weight per input member, same order as the input.
    pub weights: Vec<f64>,
}

/// Convex combination of `predictions` under `weights` (normalised here).
pub fn weighted(predictions: &[MemberPrediction], weights: &[f64]) -> Combination {
    let weights = normalize(weights);
    let value: f64 = predictions
        .iter()
        .zip(&weights)
        .map(|(p, w)| p.value * w)
        .sum();
    let confidence: f64 = predictions
        .iter()
        .zip(&weights)
        .map(|(p, w)| p.confidence * w)
        .sum();
    let (lo, hi) = predictions
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.value), hi.max(p.value))
        });
    Combination {
        value: if lo <= hi { value.clamp(lo, hi) } else { value },
        confidence: confidence.clamp(0.0, 1.0),
        weights,
    }
}

/// Plain mean of member values.
pub fn simple_average(predictions: &[MemberPrediction]) -> Combination {
    weighted(predictions, &vec![1.0; predictions.len()])
}

/// Weights proportional to confidence; equal weights when all confidences are zero.
pub fn confidence_weighted(predictions: &[MemberPrediction]) -> Combination {
    let raw: Vec<f64> = predictions.iter().map(|p| p.confidence).collect();
    weighted(predictions, &raw)
}

/// Result of [`dynamic_selection`].
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// The combination over the surviving members.
    pub combination: Combination,
    /// Indices of members that survived (or the single best fallback).
    pub selected: Vec<usize>,
    /// Per-member score `(weight / max weight) × confidence`.
    pub scores: Vec<f64>,
}

/// Score members by relative global weight × confidence, drop those below
/// `threshold`, and vote the survivors by score.
///
/// Never empty: when nobody survives, the best-scoring member (ties broken
/// by global weight, then input order) answers alone.
pub fn dynamic_selection(
    predictions: &[MemberPrediction],
    global_weights: &[f64],
    threshold: f64,
) -> Selection {
    if predictions.is_empty() || predictions.len() != global_weights.len() {
        return Selection {
            combination: simple_average(predictions),
            selected: (0..predictions.len()).collect(),
            scores: vec![0.0; predictions.len()],
        };
    }
    let max_w = global_weights
        .iter()
        .copied()
        .filter(|w| w.is_finite())
        .fold(0.0f64, f64::max);
    let scores: Vec<f64> = predictions
        .iter()
        .zip(global_weights)
        .map(|(p, w)| {
            let relative = if max_w > 0.0 { w / max_w } else { 1.0 };
            (relative * p.confidence).max(0.0)
        })
        .collect();

    let selected: Vec<usize> = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| **s >= threshold && **s > 0.0)
        .map(|(i, _)| i)
        .collect();

    let selected = if selected.is_empty() {
        let best = (0..predictions.len())
            .max_by(|&a, &b| {
                scores[a]
                    .total_cmp(&scores[b])
                    .then(global_weights[a].total_cmp(&global_weights[b]))
                    .then(b.cmp(&a))
            })
            .unwrap_or(0);
        vec![best]
    } else {
        selected
    };

    let mut vote = vec![0.0; predictions.len()];
    if selected.len() == 1 {
        vote[selected[0]] = 1.0;
    } else {
        for &i in &selected {
            vote[i] = scores[i];
        }
    }

    Selection {
        combination: weighted(predictions, &vote),
        selected,
        scores,
    }
}
