//! Per-lineage retraining state machine.
//!
//! ```text
//! Collecting ──threshold──▶ ThresholdReached ──▶ Training ──▶ Evaluating ─┬─▶ Promoted ──rollback──▶ Retired
//!      ▲                                            │                     └─▶ Rejected
//!      └──────────────── failure ───────────────────┘
//! ```
//!
//! A terminal state (Promoted, Rejected, Retired) lasts until the next
//! example arrives, which opens a new cycle in Collecting. Examples that
//! arrive while a cycle is training are kept for the next cycle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::artifacts::ArtifactStore;
use super::dataset::{self, DatasetStatistics, ExportFormat, LabeledExample};
use super::trainer::{ModelMetrics, Trainer};
use super::TrainingError;
use crate::backend::PredictorRegistry;
use crate::deployment::{DeploymentError, DeploymentManager, ModelDescriptor};
use crate::metrics;

/// Pipeline tuning (`[training]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    /// Examples per lineage that trigger training.
    pub threshold: usize,
    /// Percentage of examples held out for evaluation.
    pub holdout_pct: u8,
    /// Train in the background as soon as the threshold is reached.
    pub auto_train: bool,
    /// Examples kept per lineage; the oldest are dropped beyond this.
    pub max_examples: usize,
    /// Directory for trained artifacts; in memory when unset.
    pub artifact_dir: Option<PathBuf>,
    /// Transitions kept in the audit history.
    pub history_limit: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            threshold: 50,
            holdout_pct: 20,
            auto_train: true,
            max_examples: 10_000,
            artifact_dir: None,
            history_limit: 500,
        }
    }
}

/// Where a lineage is in its retraining cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Accumulating labeled examples.
    Collecting,
    /// Enough examples; training may start.
    ThresholdReached,
    /// Fitting a candidate.
    Training,
    /// Comparing the candidate with the incumbent.
    Evaluating,
    /// Candidate passed and is rolling out.
    Promoted,
    /// Candidate failed evaluation; the incumbent keeps serving.
    Rejected,
    /// Promoted candidate was rolled back.
    Retired,
}

impl PipelineState {
    /// Stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Collecting => "collecting",
            PipelineState::ThresholdReached => "threshold_reached",
            PipelineState::Training => "training",
            PipelineState::Evaluating => "evaluating",
            PipelineState::Promoted => "promoted",
            PipelineState::Rejected => "rejected",
            PipelineState::Retired => "retired",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Promoted | PipelineState::Rejected | PipelineState::Retired
        )
    }

    fn is_busy(&self) -> bool {
        matches!(self, PipelineState::Training | PipelineState::Evaluating)
    }
}

/// One state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineTransition {
    /// Lineage.
    pub lineage: String,
    /// Cycle number (1-based).
    pub cycle: u64,
    /// Previous state.
    pub from: PipelineState,
    /// New state.
    pub to: PipelineState,
    /// Why.
    pub reason: String,
    /// When.
    pub at: DateTime<Utc>,
}

/// Public view of a lineage's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    /// Lineage.
    pub lineage: String,
    /// Current state.
    pub state: PipelineState,
    /// Current cycle.
    pub cycle: u64,
    /// Examples waiting for the next training run.
    pub examples: usize,
    /// Last candidate version produced.
    pub candidate: Option<String>,
}

/// Result of a completed training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingOutcome {
    /// Candidate passed evaluation and started rolling out.
    Promoted,
    /// Candidate failed evaluation.
    Rejected,
}

/// Summary of one training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    /// Lineage.
    pub lineage: String,
    /// Cycle.
    pub cycle: u64,
    /// Candidate version.
    pub version: String,
    /// Promoted or rejected.
    pub outcome: TrainingOutcome,
    /// Candidate holdout metrics.
    pub candidate: ModelMetrics,
    /// Incumbent scored on the same holdout.
    pub incumbent: Option<ModelMetrics>,
    /// Fitting set size.
    pub train_size: usize,
    /// Holdout size.
    pub holdout_size: usize,
    /// Malformed examples dropped by validation.
    pub dropped: usize,
}

#[derive(Debug)]
struct LineageState {
    state: PipelineState,
    examples: VecDeque<LabeledExample>,
    seen: HashSet<String>,
    cycle: u64,
    candidate: Option<String>,
    forced: bool,
}

impl Default for LineageState {
    fn default() -> Self {
        Self {
            state: PipelineState::Collecting,
            examples: VecDeque::new(),
            seen: HashSet::new(),
            cycle: 1,
            candidate: None,
            forced: false,
        }
    }
}

/// Drives retraining per lineage; see the module docs.
pub struct TrainingPipeline {
    settings: TrainingSettings,
    trainer: Arc<dyn Trainer>,
    artifacts: Arc<ArtifactStore>,
    deployment: Arc<DeploymentManager>,
    registry: Arc<PredictorRegistry>,
    lineages: Mutex<HashMap<String, LineageState>>,
    history: Mutex<VecDeque<PipelineTransition>>,
}

impl TrainingPipeline {
    /// Pipeline that stages candidates into `deployment` and registers their
    /// predictors in `registry`.
    pub fn new(
        settings: TrainingSettings,
        trainer: Arc<dyn Trainer>,
        artifacts: Arc<ArtifactStore>,
        deployment: Arc<DeploymentManager>,
        registry: Arc<PredictorRegistry>,
    ) -> Self {
        Self {
            settings,
            trainer,
            artifacts,
            deployment,
            registry,
            lineages: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Add one labeled example and return the lineage's state afterwards.
    ///
    /// A prediction id already collected in this cycle is relabelled in
    /// place (its reconciled actual was revised) and does not count again.
    /// A promoted cycle stays open while its rollout is in flight; examples
    /// arriving meanwhile are held for the next cycle. With `auto_train`,
    /// reaching the threshold starts training in the background.
    pub fn add_example(self: &Arc<Self>, example: LabeledExample) -> PipelineState {
        let lineage = example.lineage.clone();
        let state = {
            let mut lineages = self.lineages.lock();
            let ls = lineages.entry(lineage.clone()).or_default();
            let rolling_out =
                ls.state == PipelineState::Promoted && self.deployment.has_rollout(&lineage);
            if ls.state.is_terminal() && !rolling_out {
                ls.cycle += 1;
                self.transition(&lineage, ls, PipelineState::Collecting, "new cycle");
            }
            if !ls.seen.insert(example.prediction_id.clone()) {
                if let Some(existing) = ls
                    .examples
                    .iter_mut()
                    .find(|e| e.prediction_id == example.prediction_id)
                {
                    existing.actual = example.actual;
                    existing.recorded_at = example.recorded_at;
                }
                return ls.state;
            }
            ls.examples.push_back(example);
            while ls.examples.len() > self.settings.max_examples.max(1) {
                if let Some(old) = ls.examples.pop_front() {
                    ls.seen.remove(&old.prediction_id);
                }
            }
            if ls.state == PipelineState::Collecting
                && ls.examples.len() >= self.settings.threshold.max(1)
            {
                let reason = format!("{} examples", ls.examples.len());
                self.transition(&lineage, ls, PipelineState::ThresholdReached, &reason);
            }
            ls.state
        };

        if state == PipelineState::ThresholdReached && self.settings.auto_train {
            self.spawn_training(lineage);
        }
        state
    }

    /// Run one training cycle for `lineage`.
    ///
    /// # Errors
    ///
    /// - [`TrainingError::NotReady`] / [`TrainingError::AlreadyTraining`] when
    ///   the lineage is not in a state that can train.
    /// - [`TrainingError::Deployment`] with `RolloutInProgress` while a
    ///   previous candidate is still rolling out; the state is kept.
    /// - Any training failure; the lineage returns to Collecting and keeps
    ///   its valid examples.
    pub async fn run_training(&self, lineage: &str) -> Result<TrainingReport, TrainingError> {
        let (batch, cycle) = {
            let mut lineages = self.lineages.lock();
            let ls = lineages
                .get_mut(lineage)
                .ok_or_else(|| TrainingError::UnknownLineage(lineage.to_string()))?;
            match ls.state {
                PipelineState::ThresholdReached => {}
                s if s.is_busy() => return Err(TrainingError::AlreadyTraining(lineage.to_string())),
                s => {
                    return Err(TrainingError::NotReady {
                        lineage: lineage.to_string(),
                        state: s,
                    })
                }
            }
            if self.deployment.has_rollout(lineage) {
                return Err(DeploymentError::RolloutInProgress(lineage.to_string()).into());
            }
            ls.forced = false;
            ls.seen.clear();
            let batch: Vec<LabeledExample> = ls.examples.drain(..).collect();
            self.transition(lineage, ls, PipelineState::Training, "training started");
            (batch, ls.cycle)
        };

        let (clean, dropped) = dataset::validate(batch);
        match self.train_and_evaluate(lineage, cycle, clean.clone(), dropped).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let mut lineages = self.lineages.lock();
                if let Some(ls) = lineages.get_mut(lineage) {
                    let newer: Vec<LabeledExample> = ls.examples.drain(..).collect();
                    for ex in clean.into_iter().chain(newer) {
                        if ls.seen.insert(ex.prediction_id.clone()) {
                            ls.examples.push_back(ex);
                        }
                    }
                    self.transition(lineage, ls, PipelineState::Collecting, &format!("training failed: {e}"));
                }
                warn!(lineage = lineage, error = %e, "training failed");
                Err(e)
            }
        }
    }

    /// Start an out-of-cycle training run (drift response).
    ///
    /// # Errors
    ///
    /// As [`Self::run_training`]; [`TrainingError::UnknownLineage`] if the
    /// lineage never received an example.
    pub async fn force_training(&self, lineage: &str, reason: &str) -> Result<TrainingReport, TrainingError> {
        {
            let mut lineages = self.lineages.lock();
            let ls = lineages
                .get_mut(lineage)
                .ok_or_else(|| TrainingError::UnknownLineage(lineage.to_string()))?;
            if ls.state.is_busy() {
                return Err(TrainingError::AlreadyTraining(lineage.to_string()));
            }
            if ls.state != PipelineState::ThresholdReached {
                if ls.state.is_terminal() {
                    ls.cycle += 1;
                }
                ls.forced = true;
                self.transition(lineage, ls, PipelineState::ThresholdReached, &format!("forced: {reason}"));
            }
        }
        self.run_training(lineage).await
    }

    /// Mark the pipeline cycle that produced `version` as Retired after its
    /// rollout was rolled back.
    pub fn on_rollback(&self, lineage: &str, version: &str) {
        let mut lineages = self.lineages.lock();
        let Some(ls) = lineages.get_mut(lineage) else {
            return;
        };
        if ls.state == PipelineState::Promoted && ls.candidate.as_deref() == Some(version) {
            self.transition(lineage, ls, PipelineState::Retired, &format!("{version} rolled back"));
        } else {
            debug!(lineage = lineage, version = version, state = ls.state.as_str(), "rollback outside current cycle");
        }
    }

    /// Current state of `lineage` (Collecting if unseen).
    pub fn state(&self, lineage: &str) -> PipelineState {
        self.lineages
            .lock()
            .get(lineage)
            .map_or(PipelineState::Collecting, |ls| ls.state)
    }

    /// Snapshot of one lineage.
    pub fn snapshot(&self, lineage: &str) -> Option<PipelineSnapshot> {
        self.lineages.lock().get(lineage).map(|ls| snapshot_of(lineage, ls))
    }

    /// Snapshot of every lineage.
    pub fn snapshots(&self) -> BTreeMap<String, PipelineSnapshot> {
        self.lineages
            .lock()
            .iter()
            .map(|(k, ls)| (k.clone(), snapshot_of(k, ls)))
            .collect()
    }

    /// Transition audit trail, oldest first.
    pub fn history(&self) -> Vec<PipelineTransition> {
        self.history.lock().iter().cloned().collect()
    }

    /// Statistics of the examples waiting in `lineage`.
    pub fn dataset_statistics(&self, lineage: &str) -> Option<DatasetStatistics> {
        let lineages = self.lineages.lock();
        let ls = lineages.get(lineage)?;
        let examples: Vec<LabeledExample> = ls.examples.iter().cloned().collect();
        dataset::statistics(&examples)
    }

    /// Export the examples waiting in `lineage`.
    ///
    /// # Errors
    ///
    /// [`TrainingError::UnknownLineage`] or an encoding failure.
    pub fn export_dataset(&self, lineage: &str, format: ExportFormat) -> Result<String, TrainingError> {
        let examples: Vec<LabeledExample> = {
            let lineages = self.lineages.lock();
            let ls = lineages
                .get(lineage)
                .ok_or_else(|| TrainingError::UnknownLineage(lineage.to_string()))?;
            ls.examples.iter().cloned().collect()
        };
        dataset::export(&examples, format)
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn spawn_training(self: &Arc<Self>, lineage: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lineage = %lineage, "no runtime for background training");
            return;
        };
        let pipeline = Arc::clone(self);
        handle.spawn(async move {
            match pipeline.run_training(&lineage).await {
                Ok(report) => info!(
                    lineage = %lineage,
                    version = %report.version,
                    outcome = ?report.outcome,
                    "background training finished"
                ),
                Err(TrainingError::AlreadyTraining(_)) | Err(TrainingError::NotReady { .. }) => {}
                Err(e) => debug!(lineage = %lineage, error = %e, "background training did not run"),
            }
        });
    }

    async fn train_and_evaluate(
        &self,
        lineage: &str,
        cycle: u64,
        clean: Vec<LabeledExample>,
        dropped: usize,
    ) -> Result<TrainingReport, TrainingError> {
        const MIN_EXAMPLES: usize = 2;
        if clean.len() < MIN_EXAMPLES {
            return Err(TrainingError::InsufficientData {
                lineage: lineage.to_string(),
                have: clean.len(),
                need: MIN_EXAMPLES,
            });
        }
        let split = dataset::split(clean, self.settings.holdout_pct);
        let artifact = self.trainer.fit(lineage, &split.train).await?;

        let tolerance = self.deployment.settings().accuracy_tolerance;
        let scored = split
            .holdout
            .iter()
            .map(|e| Ok((self.trainer.apply(&artifact, e.predicted)?, e.actual)))
            .collect::<Result<Vec<(f64, f64)>, TrainingError>>()?;
        let candidate = ModelMetrics::from_pairs(scored, tolerance).ok_or_else(|| {
            TrainingError::InsufficientData {
                lineage: lineage.to_string(),
                have: 0,
                need: 1,
            }
        })?;
        let incumbent =
            ModelMetrics::from_pairs(split.holdout.iter().map(|e| (e.predicted, e.actual)), tolerance);

        let active = self
            .deployment
            .active(lineage)
            .ok_or_else(|| DeploymentError::UnknownLineage(lineage.to_string()))?;
        let base = self
            .registry
            .get(&active.backend)
            .ok_or_else(|| DeploymentError::BackendMissing(active.backend.clone()))?;

        let version = self.deployment.next_version(lineage);
        let artifact_ref = self.artifacts.put(lineage, &version, &artifact).await?;
        let backend_key = format!("{lineage}@{version}");
        self.registry
            .register(backend_key.clone(), self.trainer.load(&artifact, base)?);

        let mut descriptor = ModelDescriptor::staged(lineage, &version, &backend_key);
        descriptor.artifact_location = Some(artifact_ref.location);
        descriptor.artifact_checksum = Some(artifact_ref.checksum);
        descriptor.metrics = Some(candidate);
        if let Err(e) = self.deployment.stage_candidate(descriptor) {
            self.registry.remove(&backend_key);
            return Err(e.into());
        }
        self.set_state(lineage, PipelineState::Evaluating, "candidate staged");

        let outcome = match self.deployment.evaluate(lineage, &version, incumbent) {
            Ok(_) => {
                self.deployment.start_canary(lineage, &version)?;
                TrainingOutcome::Promoted
            }
            Err(DeploymentError::EvaluationRegression { .. }) => {
                self.registry.remove(&backend_key);
                TrainingOutcome::Rejected
            }
            Err(e) => return Err(e.into()),
        };

        {
            let mut lineages = self.lineages.lock();
            if let Some(ls) = lineages.get_mut(lineage) {
                ls.candidate = Some(version.clone());
                let (to, reason) = match outcome {
                    TrainingOutcome::Promoted => (PipelineState::Promoted, format!("{version} passed evaluation")),
                    TrainingOutcome::Rejected => (PipelineState::Rejected, format!("{version} regressed")),
                };
                self.transition(lineage, ls, to, &reason);
            }
        }

        info!(
            lineage = lineage,
            version = %version,
            accuracy = candidate.accuracy,
            incumbent_accuracy = incumbent.map(|m| m.accuracy),
            outcome = ?outcome,
            "training cycle finished"
        );
        Ok(TrainingReport {
            lineage: lineage.to_string(),
            cycle,
            version,
            outcome,
            candidate,
            incumbent,
            train_size: split.train.len(),
            holdout_size: split.holdout.len(),
            dropped,
        })
    }

    fn set_state(&self, lineage: &str, to: PipelineState, reason: &str) {
        let mut lineages = self.lineages.lock();
        if let Some(ls) = lineages.get_mut(lineage) {
            self.transition(lineage, ls, to, reason);
        }
    }

    fn transition(&self, lineage: &str, ls: &mut LineageState, to: PipelineState, reason: &str) {
        let from = ls.state;
        if from == to {
            return;
        }
        ls.state = to;
        metrics::inc_pipeline_transition(lineage, to.as_str());
        info!(
            lineage = lineage,
            cycle = ls.cycle,
            from = from.as_str(),
            to = to.as_str(),
            reason = reason,
            "pipeline transition"
        );
        let mut history = self.history.lock();
        history.push_back(PipelineTransition {
            lineage: lineage.to_string(),
            cycle: ls.cycle,
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        while history.len() > self.settings.history_limit.max(1) {
            history.pop_front();
        }
    }
}

fn snapshot_of(lineage: &str, ls: &LineageState) -> PipelineSnapshot {
    PipelineSnapshot {
        lineage: lineage.to_string(),
        state: ls.state,
        cycle: ls.cycle,
        examples: ls.examples.len(),
        candidate: ls.candidate.clone(),
    }
}
