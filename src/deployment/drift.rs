//! Live-error drift detection per lineage.
//!
//! A rolling window of absolute errors is compared with the baseline MAE
//! captured when the active version was deployed (or learned from the first
//! full window when no baseline exists). Exceeding `baseline + tolerance` on
//! `sustain_checks` consecutive observations raises one alert and restarts
//! the window. A revised label replaces its earlier observation in place.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Drift detection tuning (`[deployment.drift]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DriftSettings {
    /// Rolling window length.
    pub window: usize,
    /// Observations needed before checks start.
    pub min_samples: usize,
    /// Allowed MAE increase over the baseline.
    pub tolerance: f64,
    /// Consecutive breaching checks that raise an alert.
    pub sustain_checks: u32,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            window: 100,
            min_samples: 30,
            tolerance: 0.1,
            sustain_checks: 5,
        }
    }
}

/// A sustained divergence from the baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftAlert {
    /// Lineage that drifted.
    pub lineage: String,
    /// Expected MAE.
    pub baseline_mae: f64,
    /// Rolling MAE at alert time.
    pub live_mae: f64,
    /// Observations in the window.
    pub samples: usize,
    /// Alert time.
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LineageWindow {
    errors: VecDeque<f64>,
    sum: f64,
    baseline: Option<f64>,
    breaches: u32,
}

impl LineageWindow {
    fn push(&mut self, err: f64, cap: usize) {
        self.errors.push_back(err);
        self.sum += err;
        while self.errors.len() > cap {
            if let Some(old) = self.errors.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// Swap the newest occurrence of `old` for `new`; false if it left the window.
    fn replace(&mut self, old: f64, new: f64) -> bool {
        match self.errors.iter().rposition(|e| (e - old).abs() < 1e-12) {
            Some(i) => {
                self.sum += new - self.errors[i];
                self.errors[i] = new;
                true
            }
            None => false,
        }
    }

    fn mean(&self) -> f64 {
        if self.errors.is_empty() {
            0.0
        } else {
            self.sum / self.errors.len() as f64
        }
    }

    fn clear(&mut self) {
        self.errors.clear();
        self.sum = 0.0;
        self.breaches = 0;
    }
}

/// Per-lineage drift state.
pub struct DriftDetector {
    settings: DriftSettings,
    windows: Mutex<HashMap<String, LineageWindow>>,
}

impl DriftDetector {
    /// Detector with `settings`.
    pub fn new(settings: DriftSettings) -> Self {
        Self {
            settings,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Set (or clear) the baseline MAE of `lineage` and restart its window.
    pub fn set_baseline(&self, lineage: &str, baseline_mae: Option<f64>) {
        let mut windows = self.windows.lock();
        let w = windows.entry(lineage.to_string()).or_default();
        w.baseline = baseline_mae.filter(|b| b.is_finite());
        w.clear();
    }

    /// Current baseline of `lineage`.
    pub fn baseline(&self, lineage: &str) -> Option<f64> {
        self.windows.lock().get(lineage).and_then(|w| w.baseline)
    }

    /// Rolling MAE of `lineage`.
    pub fn live_mae(&self, lineage: &str) -> Option<f64> {
        self.windows
            .lock()
            .get(lineage)
            .filter(|w| !w.errors.is_empty())
            .map(LineageWindow::mean)
    }

    /// Record one absolute error; returns an alert on sustained drift.
    pub fn observe(&self, lineage: &str, abs_error: f64) -> Option<DriftAlert> {
        self.record(lineage, None, abs_error)
    }

    /// Replace an earlier observation `previous_error` with `abs_error` after
    /// its label was revised. Falls back to a new observation when the earlier
    /// one is no longer in the window.
    pub fn revise(&self, lineage: &str, previous_error: f64, abs_error: f64) -> Option<DriftAlert> {
        self.record(lineage, Some(previous_error), abs_error)
    }

    fn record(&self, lineage: &str, previous_error: Option<f64>, abs_error: f64) -> Option<DriftAlert> {
        if !abs_error.is_finite() {
            return None;
        }
        let mut windows = self.windows.lock();
        let w = windows.entry(lineage.to_string()).or_default();
        if !previous_error.is_some_and(|prev| w.replace(prev, abs_error)) {
            w.push(abs_error, self.settings.window.max(1));
        }
        if w.errors.len() < self.settings.min_samples.max(1) {
            return None;
        }
        let live = w.mean();
        let Some(baseline) = w.baseline else {
            w.baseline = Some(live);
            return None;
        };
        if live > baseline + self.settings.tolerance {
            w.breaches += 1;
        } else {
            w.breaches = 0;
        }
        if w.breaches < self.settings.sustain_checks.max(1) {
            return None;
        }
        let alert = DriftAlert {
            lineage: lineage.to_string(),
            baseline_mae: baseline,
            live_mae: live,
            samples: w.errors.len(),
            raised_at: Utc::now(),
        };
        w.clear();
        warn!(
            lineage = lineage,
            baseline_mae = baseline,
            live_mae = live,
            "model drift detected"
        );
        Some(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> DriftDetector {
        DriftDetector::new(DriftSettings {
            window: 20,
            min_samples: 10,
            tolerance: 0.1,
            sustain_checks: 3,
        })
    }

    #[test]
    fn test_no_alert_within_tolerance() {
        let d = detector();
        d.set_baseline("alpha", Some(0.1));
        for _ in 0..100 {
            assert!(d.observe("alpha", 0.15).is_none());
        }
    }

    #[test]
    fn test_sustained_drift_alerts_once_then_restarts() {
        let d = detector();
        d.set_baseline("alpha", Some(0.05));
        let alerts: Vec<_> = (0..12).filter_map(|_| d.observe("alpha", 0.5)).collect();
        assert_eq!(alerts.len(), 1);
        assert!((alerts[0].live_mae - 0.5).abs() < 1e-9);
        assert_eq!(d.live_mae("alpha"), None);
    }

    #[test]
    fn test_baseline_learned_from_first_window() {
        let d = detector();
        for _ in 0..10 {
            d.observe("beta", 0.2);
        }
        assert!((d.baseline("beta").unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_revision_replaces_observation() {
        let d = detector();
        d.observe("alpha", 0.1);
        d.observe("alpha", 0.8);
        d.revise("alpha", 0.8, 0.0);
        assert!((d.live_mae("alpha").unwrap() - 0.05).abs() < 1e-9);

        // Unknown previous error: counted as a fresh observation.
        d.revise("alpha", 0.33, 0.3);
        assert!((d.live_mae("alpha").unwrap() - 0.4 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_resets_breach_count() {
        let d = DriftDetector::new(DriftSettings {
            window: 1,
            min_samples: 1,
            tolerance: 0.1,
            sustain_checks: 3,
        });
        d.set_baseline("alpha", Some(0.1));
        // Two breaching checks, then one healthy one, repeatedly.
        for _ in 0..10 {
            assert!(d.observe("alpha", 0.5).is_none());
            assert!(d.observe("alpha", 0.5).is_none());
            assert!(d.observe("alpha", 0.0).is_none());
        }
        assert!(d.observe("alpha", 0.5).is_none());
        assert!(d.observe("alpha", 0.5).is_none());
        assert!(d.observe("alpha", 0.5).is_some());
    }
}
