//! Version registry, canary rollout, auto-promotion and rollback.
//!
//! All state sits behind one lock and every mutation that changes traffic
//! republishes the lineage slots of the shared [`RoutingTableHandle`] before
//! the lock is released, so the table always mirrors the descriptors.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

use super::descriptor::{ModelDescriptor, ModelStatus};
use super::drift::{DriftAlert, DriftDetector, DriftSettings};
use super::DeploymentError;
use crate::backend::PredictorRegistry;
use crate::metrics;
use crate::routing::table::{RoutingTableHandle, TrafficSlot};
use crate::training::ModelMetrics;

// ─── Settings ────────────────────────────────────────────────────────────────

/// Rollout policy (`[deployment]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DeploymentSettings {
    /// Traffic share given to a freshly promoted candidate (1–100).
    pub canary_traffic_pct: u8,
    /// Live outcomes a version needs before its live accuracy is trusted.
    pub min_live_samples: usize,
    /// Rolling window of live errors kept per version.
    pub live_window: usize,
    /// `|predicted - actual|` at or below this counts as accurate.
    pub accuracy_tolerance: f64,
    /// Offline accuracy a candidate must reach.
    pub min_accuracy: f64,
    /// Offline accuracy a candidate may lose against the incumbent.
    pub regression_tolerance: f64,
    /// Live accuracy a canary may lose against the incumbent and still go to 100%.
    pub promotion_tolerance: f64,
    /// Live accuracy a fully rolled-out candidate may lose before rollback.
    pub rollback_tolerance: f64,
    /// Consecutive low-accuracy checks at 100% that trigger rollback.
    pub rollback_sustain_checks: u32,
    /// Outcomes observed at 100% before the rollout is considered complete.
    pub full_rollout_samples: usize,
    /// Audit events kept.
    pub max_events: usize,
    /// Drift detection.
    pub drift: DriftSettings,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            canary_traffic_pct: 10,
            min_live_samples: 30,
            live_window: 200,
            accuracy_tolerance: 0.1,
            min_accuracy: 0.6,
            regression_tolerance: 0.02,
            promotion_tolerance: 0.05,
            rollback_tolerance: 0.05,
            rollback_sustain_checks: 5,
            full_rollout_samples: 200,
            max_events: 500,
            drift: DriftSettings::default(),
        }
    }
}

// ─── Events and views ────────────────────────────────────────────────────────

/// Something the manager did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// A version was installed as the active one.
    Activated {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
    },
    /// A candidate was registered with no traffic.
    Staged {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
    },
    /// A candidate failed offline evaluation.
    Rejected {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
        /// Why.
        reason: String,
    },
    /// A candidate started taking a share of traffic.
    CanaryStarted {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
        /// Candidate share.
        traffic_pct: u8,
    },
    /// A candidate took over all traffic.
    FullRollout {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
    },
    /// A full rollout survived its observation period.
    RolloutCompleted {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
    },
    /// A candidate was pulled and the incumbent restored.
    RolledBack {
        /// Lineage.
        lineage: String,
        /// Candidate that was pulled.
        version: String,
        /// Version restored to 100%.
        restored: String,
        /// Why.
        reason: String,
    },
    /// Live error diverged from the baseline.
    Drift(DriftAlert),
}

/// An event with its time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// What happened.
    pub event: DeploymentEvent,
}

/// Rollout phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Candidate takes `canary_traffic_pct`.
    Canary,
    /// Candidate takes 100%, incumbent on standby for rollback.
    Full,
}

/// Public view of an in-flight rollout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutStatus {
    /// Candidate version.
    pub candidate: String,
    /// Version it would replace.
    pub incumbent: String,
    /// Current phase.
    pub phase: RolloutPhase,
    /// Accuracy the candidate is held to at 100%.
    pub baseline_accuracy: Option<f64>,
    /// Candidate live outcomes in its window.
    pub candidate_samples: usize,
}

/// Live A/B metrics of one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantMetrics {
    /// Version tag.
    pub version: String,
    /// Status.
    pub status: ModelStatus,
    /// Current traffic share.
    pub traffic_pct: u8,
    /// Live outcomes ever recorded.
    pub predictions: u64,
    /// Rolling live MAE.
    pub mae: Option<f64>,
    /// Rolling live accuracy.
    pub accuracy: Option<f64>,
    /// Offline metrics.
    pub offline: Option<ModelMetrics>,
}

/// Per-lineage deployment summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageStatus {
    /// Version at 100% or the incumbent during a canary.
    pub active_version: Option<String>,
    /// Versions with non-zero traffic.
    pub traffic: BTreeMap<String, u8>,
    /// In-flight rollout.
    pub rollout: Option<RolloutStatus>,
    /// Rolling live MAE seen by drift detection.
    pub live_mae: Option<f64>,
}

/// Outcome of a successful offline evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    /// Candidate offline accuracy.
    pub candidate_accuracy: f64,
    /// Incumbent accuracy it was compared to.
    pub incumbent_accuracy: Option<f64>,
    /// Bar the candidate had to clear.
    pub required_accuracy: f64,
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LiveWindow {
    errors: VecDeque<f64>,
    total: u64,
}

impl LiveWindow {
    fn push(&mut self, err: f64, cap: usize) {
        self.errors.push_back(err);
        self.total += 1;
        while self.errors.len() > cap {
            self.errors.pop_front();
        }
    }

    fn replace(&mut self, old: f64, new: f64) -> bool {
        match self.errors.iter().rposition(|e| (e - old).abs() < 1e-12) {
            Some(i) => {
                self.errors[i] = new;
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.errors.len()
    }

    fn accuracy(&self, tolerance: f64) -> Option<f64> {
        ModelMetrics::from_pairs(self.errors.iter().map(|e| (*e, 0.0)), tolerance).map(|m| m.accuracy)
    }

    fn mae(&self) -> Option<f64> {
        (!self.errors.is_empty()).then(|| self.errors.iter().sum::<f64>() / self.errors.len() as f64)
    }
}

#[derive(Debug, Clone)]
struct Rollout {
    candidate: String,
    incumbent: String,
    phase: RolloutPhase,
    baseline_accuracy: Option<f64>,
    low_streak: u32,
    full_samples: usize,
}

#[derive(Default)]
struct State {
    descriptors: BTreeMap<String, Vec<ModelDescriptor>>,
    rollouts: HashMap<String, Rollout>,
    live: HashMap<(String, String), LiveWindow>,
    events: VecDeque<TransitionRecord>,
}

impl State {
    fn find_mut(&mut self, lineage: &str, version: &str) -> Option<&mut ModelDescriptor> {
        self.descriptors
            .get_mut(lineage)?
            .iter_mut()
            .find(|d| d.version == version)
    }

    fn find(&self, lineage: &str, version: &str) -> Option<&ModelDescriptor> {
        self.descriptors
            .get(lineage)?
            .iter()
            .find(|d| d.version == version)
    }

    fn active(&self, lineage: &str) -> Option<&ModelDescriptor> {
        self.descriptors
            .get(lineage)?
            .iter()
            .filter(|d| d.status == ModelStatus::Active)
            .max_by_key(|d| d.traffic_percentage)
    }

    fn window(&self, lineage: &str, version: &str) -> Option<&LiveWindow> {
        self.live.get(&(lineage.to_string(), version.to_string()))
    }
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Owns model descriptors and traffic; see the module docs.
pub struct DeploymentManager {
    settings: DeploymentSettings,
    table: Arc<RoutingTableHandle>,
    registry: Arc<PredictorRegistry>,
    drift: DriftDetector,
    state: Mutex<State>,
}

impl DeploymentManager {
    /// Manager publishing into `table`; backends are looked up in `registry`.
    pub fn new(
        settings: DeploymentSettings,
        table: Arc<RoutingTableHandle>,
        registry: Arc<PredictorRegistry>,
    ) -> Self {
        Self {
            drift: DriftDetector::new(settings.drift.clone()),
            settings,
            table,
            registry,
            state: Mutex::new(State::default()),
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &DeploymentSettings {
        &self.settings
    }

    /// Drift detector.
    pub fn drift(&self) -> &DriftDetector {
        &self.drift
    }

    /// Install `version` as the active version of `lineage` at 100%.
    /// Any previously active version is retired.
    ///
    /// # Errors
    ///
    /// - [`DeploymentError::DuplicateVersion`] if the version exists.
    /// - [`DeploymentError::BackendMissing`] if `backend` is not registered.
    pub fn register_active(
        &self,
        lineage: &str,
        version: &str,
        backend: &str,
        metrics: Option<ModelMetrics>,
    ) -> Result<ModelDescriptor, DeploymentError> {
        if !self.registry.contains(backend) {
            return Err(DeploymentError::BackendMissing(backend.to_string()));
        }
        let mut st = self.state.lock();
        if st.find(lineage, version).is_some() {
            return Err(DeploymentError::DuplicateVersion {
                lineage: lineage.to_string(),
                version: version.to_string(),
            });
        }
        st.rollouts.remove(lineage);
        let list = st.descriptors.entry(lineage.to_string()).or_default();
        for d in list.iter_mut().filter(|d| d.status != ModelStatus::Retired) {
            d.status = ModelStatus::Retired;
            d.set_traffic(0);
        }
        let mut descriptor = ModelDescriptor::staged(lineage, version, backend);
        descriptor.status = ModelStatus::Active;
        descriptor.metrics = metrics;
        descriptor.set_traffic(100);
        list.push(descriptor.clone());

        self.drift.set_baseline(lineage, metrics.map(|m| m.mae));
        self.push_event(
            &mut st,
            DeploymentEvent::Activated {
                lineage: lineage.to_string(),
                version: version.to_string(),
            },
        );
        self.publish(&st);
        info!(lineage = lineage, version = version, backend = backend, "model activated");
        Ok(descriptor)
    }

    /// Next unused version tag (`v2`, `v3`, …) for `lineage`.
    pub fn next_version(&self, lineage: &str) -> String {
        let st = self.state.lock();
        let mut n = st.descriptors.get(lineage).map_or(0, Vec::len) + 1;
        while st.find(lineage, &format!("v{n}")).is_some() {
            n += 1;
        }
        format!("v{n}")
    }

    /// Register a trained candidate with no traffic.
    ///
    /// # Errors
    ///
    /// - [`DeploymentError::UnknownLineage`] if the lineage has no active version.
    /// - [`DeploymentError::RolloutInProgress`] if another candidate is rolling out.
    /// - [`DeploymentError::DuplicateVersion`] if the version exists.
    /// - [`DeploymentError::BackendMissing`] if `backend` is not registered.
    pub fn stage_candidate(&self, mut descriptor: ModelDescriptor) -> Result<ModelDescriptor, DeploymentError> {
        if !self.registry.contains(&descriptor.backend) {
            return Err(DeploymentError::BackendMissing(descriptor.backend.clone()));
        }
        let lineage = descriptor.model_id.clone();
        let version = descriptor.version.clone();
        let mut st = self.state.lock();
        if st.active(&lineage).is_none() {
            return Err(DeploymentError::UnknownLineage(lineage));
        }
        if st.rollouts.contains_key(&lineage) {
            return Err(DeploymentError::RolloutInProgress(lineage));
        }
        if st.find(&lineage, &version).is_some() {
            return Err(DeploymentError::DuplicateVersion { lineage, version });
        }
        descriptor.status = ModelStatus::Staged;
        descriptor.traffic_percentage = 0;
        descriptor.deployed_at = None;
        st.descriptors
            .entry(lineage.clone())
            .or_default()
            .push(descriptor.clone());
        self.push_event(&mut st, DeploymentEvent::Staged { lineage, version });
        Ok(descriptor)
    }

    /// Compare a staged candidate's offline metrics with the incumbent.
    ///
    /// The incumbent's stored metrics are used when present, otherwise
    /// `incumbent_fallback` (typically the incumbent scored on the same
    /// holdout). A rejected candidate is retired.
    ///
    /// # Errors
    ///
    /// - [`DeploymentError::EvaluationRegression`] when the candidate misses the bar.
    /// - [`DeploymentError::UnknownVersion`] / [`DeploymentError::InvalidState`]
    ///   if the candidate is missing or not staged.
    pub fn evaluate(
        &self,
        lineage: &str,
        version: &str,
        incumbent_fallback: Option<ModelMetrics>,
    ) -> Result<EvaluationSummary, DeploymentError> {
        let mut st = self.state.lock();
        let candidate = st
            .find(lineage, version)
            .ok_or_else(|| unknown_version(lineage, version))?;
        if candidate.status != ModelStatus::Staged {
            return Err(DeploymentError::InvalidState {
                lineage: lineage.to_string(),
                version: version.to_string(),
                status: candidate.status,
            });
        }
        let candidate_accuracy = candidate.metrics.map_or(0.0, |m| m.accuracy);
        let incumbent_accuracy = st
            .active(lineage)
            .and_then(|d| d.metrics)
            .or(incumbent_fallback)
            .map(|m| m.accuracy);
        let required = incumbent_accuracy
            .map_or(self.settings.min_accuracy, |inc| {
                self.settings
                    .min_accuracy
                    .max(inc - self.settings.regression_tolerance)
            });

        if candidate_accuracy + 1e-12 < required {
            if let Some(d) = st.find_mut(lineage, version) {
                d.status = ModelStatus::Retired;
            }
            let reason = format!(
                "accuracy {candidate_accuracy:.3} below required {required:.3}"
            );
            self.push_event(
                &mut st,
                DeploymentEvent::Rejected {
                    lineage: lineage.to_string(),
                    version: version.to_string(),
                    reason: reason.clone(),
                },
            );
            warn!(lineage = lineage, version = version, reason = %reason, "candidate rejected");
            return Err(DeploymentError::EvaluationRegression {
                lineage: lineage.to_string(),
                version: version.to_string(),
                candidate: candidate_accuracy,
                required,
            });
        }
        Ok(EvaluationSummary {
            candidate_accuracy,
            incumbent_accuracy,
            required_accuracy: required,
        })
    }

    /// Give a staged candidate its canary share (or all traffic when the
    /// canary share is 100).
    ///
    /// # Errors
    ///
    /// - [`DeploymentError::RolloutInProgress`] if another rollout is running.
    /// - [`DeploymentError::UnknownLineage`] if there is no incumbent.
    /// - [`DeploymentError::UnknownVersion`] / [`DeploymentError::InvalidState`].
    pub fn start_canary(&self, lineage: &str, version: &str) -> Result<DeploymentEvent, DeploymentError> {
        let mut st = self.state.lock();
        if st.rollouts.contains_key(lineage) {
            return Err(DeploymentError::RolloutInProgress(lineage.to_string()));
        }
        let status = st
            .find(lineage, version)
            .ok_or_else(|| unknown_version(lineage, version))?
            .status;
        if status != ModelStatus::Staged {
            return Err(DeploymentError::InvalidState {
                lineage: lineage.to_string(),
                version: version.to_string(),
                status,
            });
        }
        let incumbent = st
            .active(lineage)
            .map(|d| d.version.clone())
            .ok_or_else(|| DeploymentError::UnknownLineage(lineage.to_string()))?;

        let pct = self.settings.canary_traffic_pct.clamp(1, 100);
        let mut rollout = Rollout {
            candidate: version.to_string(),
            incumbent: incumbent.clone(),
            phase: RolloutPhase::Canary,
            baseline_accuracy: None,
            low_streak: 0,
            full_samples: 0,
        };

        let event = if pct == 100 {
            rollout.baseline_accuracy = self.incumbent_accuracy(&st, lineage, &incumbent);
            self.go_full(&mut st, lineage, &incumbent, version);
            rollout.phase = RolloutPhase::Full;
            DeploymentEvent::FullRollout {
                lineage: lineage.to_string(),
                version: version.to_string(),
            }
        } else {
            if let Some(d) = st.find_mut(lineage, version) {
                d.set_traffic(pct);
            }
            if let Some(d) = st.find_mut(lineage, &incumbent) {
                d.set_traffic(100 - pct);
            }
            DeploymentEvent::CanaryStarted {
                lineage: lineage.to_string(),
                version: version.to_string(),
                traffic_pct: pct,
            }
        };
        st.rollouts.insert(lineage.to_string(), rollout);
        self.push_event(&mut st, event.clone());
        self.publish(&st);
        info!(lineage = lineage, version = version, traffic_pct = pct, "candidate rollout started");
        Ok(event)
    }

    /// Feed one live outcome of `version`. Returns the rollout transition it
    /// caused, if any.
    pub fn record_live_outcome(
        &self,
        lineage: &str,
        version: &str,
        predicted: f64,
        actual: f64,
    ) -> Option<DeploymentEvent> {
        self.live_outcome(lineage, version, predicted, None, actual)
    }

    /// Replace a live outcome whose label changed from `previous_actual` to
    /// `actual`, then re-check the rollout. Counts as a new outcome if the
    /// earlier one already left the window.
    pub fn revise_live_outcome(
        &self,
        lineage: &str,
        version: &str,
        predicted: f64,
        previous_actual: f64,
        actual: f64,
    ) -> Option<DeploymentEvent> {
        self.live_outcome(lineage, version, predicted, Some(previous_actual), actual)
    }

    fn live_outcome(
        &self,
        lineage: &str,
        version: &str,
        predicted: f64,
        previous_actual: Option<f64>,
        actual: f64,
    ) -> Option<DeploymentEvent> {
        let err = (predicted - actual).abs();
        if !err.is_finite() {
            return None;
        }
        let mut st = self.state.lock();
        let window = st
            .live
            .entry((lineage.to_string(), version.to_string()))
            .or_default();
        let replaced = previous_actual
            .is_some_and(|prev| window.replace((predicted - prev).abs(), err));
        if !replaced {
            window.push(err, self.settings.live_window.max(1));
        }

        let mut rollout = st.rollouts.get(lineage)?.clone();
        if rollout.candidate != version {
            return None;
        }
        let tolerance = self.settings.accuracy_tolerance;
        let (samples, candidate_accuracy) = st
            .window(lineage, version)
            .map_or((0, None), |w| (w.len(), w.accuracy(tolerance)));
        let candidate_accuracy = candidate_accuracy?;

        let event = match rollout.phase {
            RolloutPhase::Canary => {
                if samples < self.settings.min_live_samples {
                    return None;
                }
                let incumbent_accuracy = self.incumbent_accuracy(&st, lineage, &rollout.incumbent);
                let bar = incumbent_accuracy.map(|a| a - self.settings.promotion_tolerance);
                if bar.map_or(true, |bar| candidate_accuracy + 1e-12 >= bar) {
                    rollout.phase = RolloutPhase::Full;
                    rollout.baseline_accuracy = incumbent_accuracy;
                    self.go_full(&mut st, lineage, &rollout.incumbent, version);
                    st.rollouts.insert(lineage.to_string(), rollout);
                    info!(lineage = lineage, version = version, accuracy = candidate_accuracy, "canary promoted to full traffic");
                    DeploymentEvent::FullRollout {
                        lineage: lineage.to_string(),
                        version: version.to_string(),
                    }
                } else {
                    let reason = format!(
                        "canary accuracy {candidate_accuracy:.3} below {:.3}",
                        bar.unwrap_or_default()
                    );
                    self.roll_back(&mut st, lineage, &rollout, reason)
                }
            }
            RolloutPhase::Full => {
                if !replaced {
                    rollout.full_samples += 1;
                }
                let bar = rollout
                    .baseline_accuracy
                    .map(|a| a - self.settings.rollback_tolerance);
                if samples >= self.settings.min_live_samples
                    && bar.is_some_and(|bar| candidate_accuracy + 1e-12 < bar)
                {
                    rollout.low_streak += 1;
                } else {
                    rollout.low_streak = 0;
                }
                if rollout.low_streak >= self.settings.rollback_sustain_checks.max(1) {
                    let reason = format!(
                        "live accuracy {candidate_accuracy:.3} sustained below {:.3}",
                        bar.unwrap_or_default()
                    );
                    self.roll_back(&mut st, lineage, &rollout, reason)
                } else if rollout.full_samples >= self.settings.full_rollout_samples.max(1) {
                    st.rollouts.remove(lineage);
                    let mae = st.window(lineage, version).and_then(LiveWindow::mae);
                    self.drift.set_baseline(lineage, mae);
                    info!(lineage = lineage, version = version, "rollout completed");
                    DeploymentEvent::RolloutCompleted {
                        lineage: lineage.to_string(),
                        version: version.to_string(),
                    }
                } else {
                    st.rollouts.insert(lineage.to_string(), rollout);
                    return None;
                }
            }
        };
        self.push_event(&mut st, event.clone());
        self.publish(&st);
        Some(event)
    }

    /// Pull the in-flight candidate of `lineage` and restore the incumbent.
    ///
    /// # Errors
    ///
    /// Returns [`DeploymentError::NoRollout`] if nothing is rolling out.
    pub fn rollback(&self, lineage: &str, reason: &str) -> Result<DeploymentEvent, DeploymentError> {
        let mut st = self.state.lock();
        let rollout = st
            .rollouts
            .get(lineage)
            .cloned()
            .ok_or_else(|| DeploymentError::NoRollout(lineage.to_string()))?;
        let event = self.roll_back(&mut st, lineage, &rollout, reason.to_string());
        self.push_event(&mut st, event.clone());
        self.publish(&st);
        Ok(event)
    }

    /// Feed one live absolute error to drift detection.
    pub fn observe_drift(&self, lineage: &str, abs_error: f64) -> Option<DriftAlert> {
        let alert = self.drift.observe(lineage, abs_error)?;
        self.drift_alerted(alert)
    }

    /// Like [`Self::observe_drift`] for a revised label: the earlier error is
    /// replaced instead of counted twice.
    pub fn revise_drift(&self, lineage: &str, previous_error: f64, abs_error: f64) -> Option<DriftAlert> {
        let alert = self.drift.revise(lineage, previous_error, abs_error)?;
        self.drift_alerted(alert)
    }

    fn drift_alerted(&self, alert: DriftAlert) -> Option<DriftAlert> {
        let mut st = self.state.lock();
        self.push_event(&mut st, DeploymentEvent::Drift(alert.clone()));
        Some(alert)
    }

    /// Live A/B metrics per version of `lineage`, newest first.
    pub fn variant_report(&self, lineage: &str) -> Vec<VariantMetrics> {
        let st = self.state.lock();
        let tolerance = self.settings.accuracy_tolerance;
        let mut out: Vec<VariantMetrics> = st
            .descriptors
            .get(lineage)
            .map(|list| {
                list.iter()
                    .map(|d| {
                        let w = st.window(lineage, &d.version);
                        VariantMetrics {
                            version: d.version.clone(),
                            status: d.status,
                            traffic_pct: d.traffic_percentage,
                            predictions: w.map_or(0, |w| w.total),
                            mae: w.and_then(LiveWindow::mae),
                            accuracy: w.and_then(|w| w.accuracy(tolerance)),
                            offline: d.metrics,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.reverse();
        out
    }

    /// Rolling live accuracy of one version.
    pub fn live_accuracy(&self, lineage: &str, version: &str) -> Option<f64> {
        self.state
            .lock()
            .window(lineage, version)
            .and_then(|w| w.accuracy(self.settings.accuracy_tolerance))
    }

    /// The active (or incumbent) descriptor of `lineage`.
    pub fn active(&self, lineage: &str) -> Option<ModelDescriptor> {
        self.state.lock().active(lineage).cloned()
    }

    /// One descriptor.
    pub fn descriptor(&self, lineage: &str, version: &str) -> Option<ModelDescriptor> {
        self.state.lock().find(lineage, version).cloned()
    }

    /// Every descriptor of `lineage`, oldest first.
    pub fn descriptors(&self, lineage: &str) -> Vec<ModelDescriptor> {
        self.state
            .lock()
            .descriptors
            .get(lineage)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a candidate of `lineage` is rolling out.
    pub fn has_rollout(&self, lineage: &str) -> bool {
        self.state.lock().rollouts.contains_key(lineage)
    }

    /// Summary per lineage.
    pub fn status(&self) -> BTreeMap<String, LineageStatus> {
        let st = self.state.lock();
        st.descriptors
            .iter()
            .map(|(lineage, list)| {
                let rollout = st.rollouts.get(lineage).map(|r| RolloutStatus {
                    candidate: r.candidate.clone(),
                    incumbent: r.incumbent.clone(),
                    phase: r.phase,
                    baseline_accuracy: r.baseline_accuracy,
                    candidate_samples: st.window(lineage, &r.candidate).map_or(0, LiveWindow::len),
                });
                let status = LineageStatus {
                    active_version: st.active(lineage).map(|d| d.version.clone()),
                    traffic: list
                        .iter()
                        .filter(|d| d.traffic_percentage > 0)
                        .map(|d| (d.version.clone(), d.traffic_percentage))
                        .collect(),
                    rollout,
                    live_mae: self.drift.live_mae(lineage),
                };
                (lineage.clone(), status)
            })
            .collect()
    }

    /// Audit trail, oldest first.
    pub fn events(&self) -> Vec<TransitionRecord> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// All descriptors, for snapshots.
    pub fn export_descriptors(&self) -> Vec<ModelDescriptor> {
        self.state
            .lock()
            .descriptors
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Replace all descriptors from a snapshot and republish traffic.
    ///
    /// In-flight rollouts are not part of a snapshot, so any lineage captured
    /// mid-canary is normalised back to its incumbent at 100%. Returns the
    /// backend keys the restored descriptors need but the registry lacks.
    pub fn restore_descriptors(&self, descriptors: Vec<ModelDescriptor>) -> Vec<String> {
        let mut st = self.state.lock();
        st.rollouts.clear();
        st.descriptors.clear();
        for d in descriptors {
            st.descriptors.entry(d.model_id.clone()).or_default().push(d);
        }
        let mut missing = Vec::new();
        for (lineage, list) in st.descriptors.iter_mut() {
            let has_active = list.iter().any(|d| d.status == ModelStatus::Active);
            for d in list.iter_mut() {
                if d.status == ModelStatus::Staged && d.traffic_percentage > 0 && has_active {
                    d.status = ModelStatus::Retired;
                    d.set_traffic(0);
                }
            }
            let active_count = list.iter().filter(|d| d.status == ModelStatus::Active).count();
            if active_count == 1 {
                for d in list.iter_mut().filter(|d| d.status == ModelStatus::Active) {
                    d.set_traffic(100);
                }
            }
            for d in list.iter().filter(|d| d.traffic_percentage > 0) {
                if !self.registry.contains(&d.backend) {
                    missing.push(d.backend.clone());
                }
            }
            let baseline = list
                .iter()
                .find(|d| d.status == ModelStatus::Active)
                .and_then(|d| d.metrics)
                .map(|m| m.mae);
            self.drift.set_baseline(lineage, baseline);
        }
        self.publish(&st);
        missing.sort();
        missing.dedup();
        missing
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn incumbent_accuracy(&self, st: &State, lineage: &str, incumbent: &str) -> Option<f64> {
        let live = st
            .window(lineage, incumbent)
            .filter(|w| w.len() >= self.settings.min_live_samples)
            .and_then(|w| w.accuracy(self.settings.accuracy_tolerance));
        live.or_else(|| st.find(lineage, incumbent).and_then(|d| d.metrics).map(|m| m.accuracy))
    }

    fn go_full(&self, st: &mut State, lineage: &str, incumbent: &str, candidate: &str) {
        if let Some(d) = st.find_mut(lineage, candidate) {
            d.status = ModelStatus::Active;
            d.set_traffic(100);
        }
        if let Some(d) = st.find_mut(lineage, incumbent) {
            d.status = ModelStatus::Retired;
            d.set_traffic(0);
        }
    }

    fn roll_back(&self, st: &mut State, lineage: &str, rollout: &Rollout, reason: String) -> DeploymentEvent {
        st.rollouts.remove(lineage);
        if let Some(d) = st.find_mut(lineage, &rollout.candidate) {
            d.status = ModelStatus::Retired;
            d.set_traffic(0);
        }
        let mut baseline = None;
        if let Some(d) = st.find_mut(lineage, &rollout.incumbent) {
            d.status = ModelStatus::Active;
            d.set_traffic(100);
            baseline = d.metrics.map(|m| m.mae);
        }
        self.drift.set_baseline(lineage, baseline);
        warn!(
            lineage = lineage,
            candidate = %rollout.candidate,
            restored = %rollout.incumbent,
            reason = %reason,
            "rolled back candidate"
        );
        DeploymentEvent::RolledBack {
            lineage: lineage.to_string(),
            version: rollout.candidate.clone(),
            restored: rollout.incumbent.clone(),
            reason,
        }
    }

    fn push_event(&self, st: &mut State, event: DeploymentEvent) {
        st.events.push_back(TransitionRecord {
            at: Utc::now(),
            event,
        });
        while st.events.len() > self.settings.max_events.max(1) {
            st.events.pop_front();
        }
    }

    fn publish(&self, st: &State) {
        let slots: Vec<(String, Vec<TrafficSlot>)> = st
            .descriptors
            .iter()
            .map(|(lineage, list)| {
                let slots = list
                    .iter()
                    .filter(|d| d.traffic_percentage > 0)
                    .map(|d| TrafficSlot {
                        version: d.version.clone(),
                        backend: d.backend.clone(),
                        traffic_pct: d.traffic_percentage,
                    })
                    .collect();
                (lineage.clone(), slots)
            })
            .collect();
        for list in st.descriptors.values() {
            for d in list {
                metrics::set_deployment_traffic(&d.model_id, &d.version, d.traffic_percentage);
            }
        }
        self.table.update(|current| {
            slots
                .iter()
                .fold(current.clone(), |table, (lineage, s)| table.with_lineage(lineage.clone(), s.clone()))
        });
    }
}

fn unknown_version(lineage: &str, version: &str) -> DeploymentError {
    DeploymentError::UnknownVersion {
        lineage: lineage.to_string(),
        version: version.to_string(),
    }
}
