//! # Stage: Feedback Collection
//!
//! ## Responsibility
//! Durably capture every served prediction and every piece of feedback about
//! it, reconcile multiple feedback sources into one ground truth, and hand
//! freshly resolved outcomes to the learning loop.
//!
//! ## Guarantees
//! - Non-blocking capture: `write_prediction` only enqueues; a background
//!   flusher writes batches to the store
//! - Bounded: the write queue drops its oldest item on overflow and counts it
//! - Single flusher: concurrent `flush_queue` calls serialise, so the same
//!   batch is never written twice
//! - Idempotent outcomes: `(prediction_id, feedback_type)` holds one entry;
//!   resubmission replaces it
//! - Deterministic reconciliation: highest-priority source wins, most recent
//!   breaks ties
//! - Outcome sinks are notified whenever a prediction's reconciled actual
//!   changes (first resolution or a higher-priority revision), never while an
//!   internal lock is held
//! - Degraded reads: when the store is down, read APIs answer
//!   [`ReadResult::Unavailable`] instead of an error or a fake empty result
//!
//! ## NOT Responsible For
//! - Choosing what to learn from an outcome (that belongs to `learning`)
//! - Retraining models (that belongs to `training`)

pub mod queue;
pub mod reconcile;
pub mod record;
pub mod sources;
pub mod store;

pub use queue::{PendingWrite, WriteQueue};
pub use reconcile::ReconciliationPolicy;
pub use record::{FeedbackEntry, FeedbackType, NewPrediction, PredictionRecord};
pub use store::{MemoryStore, PredictionStore, StoreError};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::routing::retry::RetryPolicy;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors returned by the feedback collector.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedbackError {
    /// The score is not a finite value in `[0, 1]`.
    #[error("invalid feedback score: {0}")]
    InvalidScore(f64),

    /// The payload could not be mapped onto a score.
    #[error("cannot normalise {feedback_type} feedback: {reason}")]
    Unnormalizable {
        /// Feedback type that was submitted.
        feedback_type: FeedbackType,
        /// Why it was rejected.
        reason: String,
    },

    /// No prediction with this id was ever stored or queued.
    #[error("unknown prediction: {0}")]
    UnknownPrediction(String),

    /// The store could not be reached.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Collector tuning (`[feedback]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct FeedbackSettings {
    /// Maximum queued writes before the oldest is dropped.
    pub queue_capacity: usize,
    /// Writes per store batch; reaching it wakes the flusher early.
    pub batch_size: usize,
    /// Flusher period in milliseconds.
    pub flush_interval_ms: u64,
    /// Attempts per outcome write before it is queued instead.
    pub max_retries: usize,
    /// First retry delay in milliseconds (doubles per attempt).
    pub retry_base_ms: u64,
    /// Reconciliation priority per feedback type.
    pub priorities: ReconciliationPolicy,
    /// Feedback-rate percentage under which monitoring raises an alert.
    pub alert_threshold_pct: f64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 50,
            flush_interval_ms: 5_000,
            max_retries: 3,
            retry_base_ms: 50,
            priorities: ReconciliationPolicy::default(),
            alert_threshold_pct: 5.0,
        }
    }
}

impl FeedbackSettings {
    /// Flusher period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Whether an outcome reached the store or is waiting in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Written and reconciled.
    Recorded,
    /// Store unavailable; applied on a later flush.
    Queued,
}

/// Acknowledgement of `record_outcome`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeReceipt {
    /// Prediction the feedback refers to.
    pub prediction_id: String,
    /// Type submitted.
    pub feedback_type: FeedbackType,
    /// Normalised score.
    pub score: f64,
    /// Recorded or queued.
    pub status: OutcomeStatus,
    /// `false` when an earlier entry of the same type was replaced.
    pub created: bool,
    /// Reconciled actual value after this write.
    pub actual_value: Option<f64>,
    /// Reconciled absolute error after this write.
    pub error: Option<f64>,
}

/// A prediction whose reconciled actual was set or changed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeEvent {
    /// The prediction with its outcome fields filled in.
    pub record: PredictionRecord,
    /// Reconciled ground truth.
    pub actual: f64,
    /// Source that supplied it.
    pub source: FeedbackType,
    /// Actual the prediction carried before this event; `None` on first
    /// resolution.
    pub previous: Option<f64>,
}

impl OutcomeEvent {
    /// Whether this event replaces an earlier label.
    pub fn is_revision(&self) -> bool {
        self.previous.is_some()
    }
}

/// Receiver of reconciled outcomes.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Called after each change of a prediction's reconciled actual.
    async fn on_outcome(&self, event: &OutcomeEvent);
}

/// Result of a read API: data, or an explicit outage marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ReadResult<T> {
    /// Store answered.
    Available(T),
    /// Store could not be reached.
    Unavailable {
        /// Store error text.
        reason: String,
    },
}

impl<T> ReadResult<T> {
    /// Whether data is present.
    pub fn is_available(&self) -> bool {
        matches!(self, ReadResult::Available(_))
    }

    /// The data, if available.
    pub fn into_option(self) -> Option<T> {
        match self {
            ReadResult::Available(v) => Some(v),
            ReadResult::Unavailable { .. } => None,
        }
    }
}

/// Outcome of one `flush_queue` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    /// Predictions inserted.
    pub predictions_written: usize,
    /// Queued outcomes applied.
    pub outcomes_applied: usize,
    /// Queued outcomes whose prediction no longer exists.
    pub outcomes_discarded: usize,
}

/// Feedback aggregates over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackStats {
    /// Service filter, if any.
    pub service: Option<String>,
    /// Window length in days.
    pub days: u32,
    /// Predictions served in the window.
    pub total_predictions: usize,
    /// Predictions with a reconciled outcome.
    pub with_outcome: usize,
    /// `with_outcome / total_predictions` as a percentage.
    pub feedback_rate_pct: f64,
    /// Mean absolute error over resolved predictions.
    pub mean_error: Option<f64>,
    /// Mean predicted value over resolved predictions.
    pub mean_predicted: Option<f64>,
    /// Mean actual value over resolved predictions.
    pub mean_actual: Option<f64>,
    /// Feedback entries per type.
    pub entries_by_type: BTreeMap<String, usize>,
    /// Which type supplied the actual value, per type.
    pub actual_source_by_type: BTreeMap<String, usize>,
}

/// Health of feedback collection for alerting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackHealth {
    /// Last-24h statistics.
    pub stats: FeedbackStats,
    /// Threshold the rate is compared against.
    pub alert_threshold_pct: f64,
    /// Whether the feedback rate is under the threshold.
    pub alert: bool,
    /// Human-readable summary.
    pub message: String,
    /// Writes waiting for the store.
    pub queue_depth: usize,
    /// Writes dropped on overflow since start.
    pub dropped_writes: u64,
}

struct Applied {
    created: bool,
    actual: Option<f64>,
    error: Option<f64>,
    event: Option<OutcomeEvent>,
}

// ─── Collector ───────────────────────────────────────────────────────────────

/// Captures predictions and outcomes; see the module docs for guarantees.
pub struct FeedbackCollector {
    store: Arc<dyn PredictionStore>,
    queue: WriteQueue,
    flush_lock: Mutex<()>,
    apply_lock: Mutex<()>,
    settings: FeedbackSettings,
    retry: RetryPolicy,
    sinks: RwLock<Vec<Arc<dyn OutcomeSink>>>,
}

impl FeedbackCollector {
    /// Collector over `store`.
    pub fn new(store: Arc<dyn PredictionStore>, settings: FeedbackSettings) -> Self {
        let retry = RetryPolicy::exponential(
            settings.max_retries.max(1),
            Duration::from_millis(settings.retry_base_ms),
        );
        Self {
            store,
            queue: WriteQueue::new(settings.queue_capacity, settings.batch_size),
            flush_lock: Mutex::new(()),
            apply_lock: Mutex::new(()),
            retry,
            settings,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &FeedbackSettings {
        &self.settings
    }

    /// The write queue.
    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    /// Register a receiver of first-time outcomes.
    pub fn add_sink(&self, sink: Arc<dyn OutcomeSink>) {
        self.sinks.write().push(sink);
    }

    /// Enqueue a served prediction and return its id. Never blocks on the store.
    pub fn write_prediction(&self, id: impl Into<String>, prediction: NewPrediction) -> String {
        let id = id.into();
        let record = PredictionRecord::from_new(id.clone(), prediction);
        self.queue.push(PendingWrite::Prediction(record));
        id
    }

    /// Write queued predictions and outcomes to the store in batches.
    ///
    /// Only one flush runs at a time; a concurrent caller waits and then
    /// flushes whatever arrived meanwhile. On a store failure the unwritten
    /// items return to the front of the queue in their original order.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError::PersistenceUnavailable`] if the store failed;
    /// the affected items stay queued.
    pub async fn flush_queue(&self) -> Result<FlushReport, FeedbackError> {
        let guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();
        let mut events = Vec::new();
        let mut remaining = self.queue.len();
        let mut failure = None;

        while remaining > 0 {
            let batch = self.queue.drain(self.settings.batch_size.max(1).min(remaining));
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());

            let predictions: Vec<PredictionRecord> = batch
                .iter()
                .filter_map(|item| match item {
                    PendingWrite::Prediction(r) => Some(r.clone()),
                    PendingWrite::Outcome(_) => None,
                })
                .collect();

            if !predictions.is_empty() {
                if let Err(e) = self.store.insert_predictions(&predictions).await {
                    self.queue.requeue_front(batch);
                    failure = Some(e.to_string());
                    break;
                }
                report.predictions_written += predictions.len();
            }

            let mut unapplied = Vec::new();
            for item in batch {
                let PendingWrite::Outcome(entry) = item else {
                    continue;
                };
                if !unapplied.is_empty() {
                    unapplied.push(PendingWrite::Outcome(entry));
                    continue;
                }
                match self.apply_outcome(&entry).await {
                    Ok(applied) => {
                        report.outcomes_applied += 1;
                        events.extend(applied.event);
                    }
                    Err(StoreError::NotFound(id)) => {
                        warn!(prediction_id = %id, "discarding queued feedback for missing prediction");
                        report.outcomes_discarded += 1;
                    }
                    Err(StoreError::Unavailable(reason)) => {
                        failure = Some(reason);
                        unapplied.push(PendingWrite::Outcome(entry));
                    }
                }
            }
            if !unapplied.is_empty() {
                self.queue.requeue_front(unapplied);
                break;
            }
        }
        drop(guard);

        self.notify_sinks(&events).await;
        match failure {
            Some(reason) => {
                warn!(reason = %reason, queued = self.queue.len(), "feedback flush incomplete");
                Err(FeedbackError::PersistenceUnavailable(reason))
            }
            None => {
                if report.predictions_written + report.outcomes_applied > 0 {
                    debug!(
                        predictions = report.predictions_written,
                        outcomes = report.outcomes_applied,
                        "feedback queue flushed"
                    );
                }
                Ok(report)
            }
        }
    }

    /// Record ground truth for a prediction.
    ///
    /// Upserts the `(prediction_id, feedback_type)` entry, reconciles all
    /// entries of the prediction, and writes the winner as the actual value.
    /// Store failures are retried with backoff; if the store stays down the
    /// entry is queued and the receipt says [`OutcomeStatus::Queued`].
    ///
    /// # Errors
    ///
    /// - [`FeedbackError::InvalidScore`] if `score` is not in `[0, 1]`.
    /// - [`FeedbackError::UnknownPrediction`] if no such prediction exists.
    pub async fn record_outcome(
        &self,
        prediction_id: &str,
        feedback_type: FeedbackType,
        score: f64,
        metadata: Value,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(FeedbackError::InvalidScore(score));
        }
        if self.queue.contains_prediction(prediction_id) {
            if let Err(e) = self.flush_queue().await {
                debug!(error = %e, "pre-outcome flush failed");
            }
        }

        let entry = FeedbackEntry {
            prediction_id: prediction_id.to_string(),
            feedback_type,
            score,
            raw: metadata,
            recorded_at: Utc::now(),
        };

        let result = self
            .retry
            .retry_if(
                || self.apply_outcome(&entry),
                |e| matches!(e, StoreError::Unavailable(_)),
            )
            .await;

        match result {
            Ok(applied) => {
                metrics::inc_feedback_outcome(feedback_type.as_str());
                if let Some(event) = &applied.event {
                    self.notify_sinks(std::slice::from_ref(event)).await;
                }
                Ok(OutcomeReceipt {
                    prediction_id: prediction_id.to_string(),
                    feedback_type,
                    score,
                    status: OutcomeStatus::Recorded,
                    created: applied.created,
                    actual_value: applied.actual,
                    error: applied.error,
                })
            }
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    prediction_id = prediction_id,
                    reason = %reason,
                    "store unavailable, queueing feedback"
                );
                self.queue.push(PendingWrite::Outcome(entry));
                Ok(OutcomeReceipt {
                    prediction_id: prediction_id.to_string(),
                    feedback_type,
                    score,
                    status: OutcomeStatus::Queued,
                    created: true,
                    actual_value: None,
                    error: None,
                })
            }
            Err(StoreError::NotFound(id)) => Err(FeedbackError::UnknownPrediction(id)),
        }
    }

    /// Normalise a raw payload for `feedback_type` and record it.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::Unnormalizable`] when the payload has no usable score,
    /// plus everything [`Self::record_outcome`] returns.
    pub async fn submit_outcome(
        &self,
        prediction_id: &str,
        feedback_type: FeedbackType,
        payload: Value,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        let score = sources::normalize_payload(feedback_type, &payload).ok_or_else(|| {
            FeedbackError::Unnormalizable {
                feedback_type,
                reason: format!("no score in payload {payload}"),
            }
        })?;
        self.record_outcome(prediction_id, feedback_type, score, payload)
            .await
    }

    /// End-user rating on a 0–1 or 1–5 scale.
    ///
    /// # Errors
    ///
    /// As [`Self::submit_outcome`].
    pub async fn collect_user_feedback(
        &self,
        prediction_id: &str,
        rating: f64,
        comment: Option<&str>,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        let score = sources::normalize_rating(rating).ok_or(FeedbackError::InvalidScore(rating))?;
        self.record_outcome(
            prediction_id,
            FeedbackType::User,
            score,
            json!({"rating": rating, "comment": comment}),
        )
        .await
    }

    /// Bot-observed outcome (`"success"`, `"failure"`, bool or number).
    ///
    /// # Errors
    ///
    /// As [`Self::submit_outcome`].
    pub async fn collect_bot_feedback(
        &self,
        prediction_id: &str,
        outcome: Value,
        metadata: Value,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        let score =
            sources::bot_outcome_score(&outcome).ok_or_else(|| FeedbackError::Unnormalizable {
                feedback_type: FeedbackType::Bot,
                reason: format!("unrecognised outcome {outcome}"),
            })?;
        self.record_outcome(
            prediction_id,
            FeedbackType::Bot,
            score,
            json!({"outcome": outcome, "metadata": metadata}),
        )
        .await
    }

    /// Survey answers; an explicit overall rating takes precedence.
    ///
    /// # Errors
    ///
    /// As [`Self::submit_outcome`].
    pub async fn collect_survey_feedback(
        &self,
        prediction_id: &str,
        responses: Vec<Value>,
        rating: Option<f64>,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        let score = sources::survey_score(&responses, rating).ok_or_else(|| {
            FeedbackError::Unnormalizable {
                feedback_type: FeedbackType::Survey,
                reason: "no numeric responses".to_string(),
            }
        })?;
        self.record_outcome(
            prediction_id,
            FeedbackType::Survey,
            score,
            json!({"responses": responses, "rating": rating}),
        )
        .await
    }

    /// Free-text comment with a sentiment label; an explicit rating wins.
    ///
    /// # Errors
    ///
    /// As [`Self::submit_outcome`].
    pub async fn collect_comment_feedback(
        &self,
        prediction_id: &str,
        text: &str,
        sentiment: &str,
        rating: Option<f64>,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        let score = match rating {
            Some(r) => sources::normalize_rating(r).ok_or(FeedbackError::InvalidScore(r))?,
            None => sources::sentiment_score(sentiment),
        };
        self.record_outcome(
            prediction_id,
            FeedbackType::Comment,
            score,
            json!({"text": text, "sentiment": sentiment, "rating": rating}),
        )
        .await
    }

    /// Verdict of an automated evaluator; an explicit score wins.
    ///
    /// # Errors
    ///
    /// As [`Self::submit_outcome`].
    pub async fn collect_ai_system_feedback(
        &self,
        prediction_id: &str,
        evaluation: &str,
        score: Option<f64>,
        metadata: Value,
    ) -> Result<OutcomeReceipt, FeedbackError> {
        let normalized = match score {
            Some(s) => sources::normalize_rating(s).ok_or(FeedbackError::InvalidScore(s))?,
            None => sources::evaluation_score(evaluation),
        };
        self.record_outcome(
            prediction_id,
            FeedbackType::AiSystem,
            normalized,
            json!({"evaluation": evaluation, "score": score, "metadata": metadata}),
        )
        .await
    }

    /// Aggregates over the last `days` days.
    pub async fn get_feedback_stats(&self, service: Option<&str>, days: u32) -> ReadResult<FeedbackStats> {
        match self.compute_stats(service, days).await {
            Ok(stats) => ReadResult::Available(stats),
            Err(e) => ReadResult::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    /// Newest predictions still waiting for an outcome.
    pub async fn get_predictions_needing_feedback(
        &self,
        service: Option<&str>,
        limit: usize,
    ) -> ReadResult<Vec<PredictionRecord>> {
        match self.store.unresolved_predictions(service, limit).await {
            Ok(records) => ReadResult::Available(records),
            Err(e) => ReadResult::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    /// Last-24h feedback rate against `alert_threshold_pct` (or the
    /// configured threshold).
    pub async fn monitor_feedback_collection(
        &self,
        service: Option<&str>,
        alert_threshold_pct: Option<f64>,
    ) -> ReadResult<FeedbackHealth> {
        let stats = match self.compute_stats(service, 1).await {
            Ok(stats) => stats,
            Err(e) => {
                return ReadResult::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        let threshold = alert_threshold_pct.unwrap_or(self.settings.alert_threshold_pct);
        let alert = stats.total_predictions > 0 && stats.feedback_rate_pct < threshold;
        let message = if stats.total_predictions == 0 {
            "no predictions in the last 24h".to_string()
        } else if alert {
            format!(
                "feedback rate {:.1}% is below {:.1}%",
                stats.feedback_rate_pct, threshold
            )
        } else {
            format!("feedback rate {:.1}% is healthy", stats.feedback_rate_pct)
        };
        if alert {
            warn!(rate_pct = stats.feedback_rate_pct, threshold_pct = threshold, "low feedback rate");
        }
        ReadResult::Available(FeedbackHealth {
            stats,
            alert_threshold_pct: threshold,
            alert,
            message,
            queue_depth: self.queue.len(),
            dropped_writes: self.queue.dropped(),
        })
    }

    /// Spawn the periodic flusher. It also wakes when the queue reaches one
    /// batch, and performs a final flush when `shutdown` flips to `true`.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.settings.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = collector.settings.flush_interval_ms,
                "feedback flusher started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = collector.queue.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            if let Err(e) = collector.flush_queue().await {
                                warn!(error = %e, "final feedback flush failed");
                            }
                            info!("feedback flusher stopped");
                            break;
                        }
                    }
                }
                if collector.queue.is_empty() {
                    continue;
                }
                if let Err(e) = collector.flush_queue().await {
                    warn!(error = %e, "feedback flush failed, will retry");
                }
            }
        })
    }

    // ── internals ───────────────────────────────────────────────────────────

    async fn apply_outcome(&self, entry: &FeedbackEntry) -> Result<Applied, StoreError> {
        let _guard = self.apply_lock.lock().await;
        let record = self
            .store
            .get_prediction(&entry.prediction_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(entry.prediction_id.clone()))?;
        let created = self.store.upsert_feedback(entry).await?;
        let entries = self.store.feedback_for(&entry.prediction_id).await?;

        let Some(winner) = self.settings.priorities.reconcile(&entries) else {
            return Ok(Applied {
                created,
                actual: record.actual_value,
                error: record.error,
                event: None,
            });
        };
        let actual = winner.score;
        let source = winner.feedback_type;
        let error = (record.predicted_value - actual).abs();

        if record.actual_value != Some(actual) || record.actual_source != Some(source) {
            self.store
                .update_actual(&record.id, actual, error, source)
                .await?;
        }

        let previous = record.actual_value;
        let event = if previous != Some(actual) {
            let mut resolved = record;
            resolved.actual_value = Some(actual);
            resolved.error = Some(error);
            resolved.actual_source = Some(source);
            resolved.resolved_at = Some(Utc::now());
            if let Some(previous) = previous {
                debug!(
                    prediction_id = %resolved.id,
                    previous,
                    actual,
                    source = source.as_str(),
                    "reconciled actual revised"
                );
            }
            Some(OutcomeEvent {
                record: resolved,
                actual,
                source,
                previous,
            })
        } else {
            None
        };

        Ok(Applied {
            created,
            actual: Some(actual),
            error: Some(error),
            event,
        })
    }

    async fn notify_sinks(&self, events: &[OutcomeEvent]) {
        if events.is_empty() {
            return;
        }
        let sinks: Vec<Arc<dyn OutcomeSink>> = self.sinks.read().clone();
        for event in events {
            for sink in &sinks {
                sink.on_outcome(event).await;
            }
        }
    }

    async fn compute_stats(&self, service: Option<&str>, days: u32) -> Result<FeedbackStats, StoreError> {
        let to = Utc::now() + ChronoDuration::seconds(1);
        let from = to - ChronoDuration::days(i64::from(days.max(1)));
        let records = self.store.predictions_between(service, from, to).await?;

        let mut entries_by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut actual_source_by_type: BTreeMap<String, usize> = BTreeMap::new();
        let (mut with_outcome, mut sum_err, mut sum_pred, mut sum_act) = (0usize, 0.0, 0.0, 0.0);

        for record in &records {
            for entry in self.store.feedback_for(&record.id).await? {
                *entries_by_type
                    .entry(entry.feedback_type.as_str().to_string())
                    .or_default() += 1;
            }
            if let (Some(actual), Some(err)) = (record.actual_value, record.error) {
                with_outcome += 1;
                sum_err += err;
                sum_pred += record.predicted_value;
                sum_act += actual;
                if let Some(src) = record.actual_source {
                    *actual_source_by_type
                        .entry(src.as_str().to_string())
                        .or_default() += 1;
                }
            }
        }

        let mean = |sum: f64| (with_outcome > 0).then(|| sum / with_outcome as f64);
        Ok(FeedbackStats {
            service: service.map(str::to_string),
            days,
            total_predictions: records.len(),
            with_outcome,
            feedback_rate_pct: if records.is_empty() {
                0.0
            } else {
                with_outcome as f64 * 100.0 / records.len() as f64
            },
            mean_error: mean(sum_err),
            mean_predicted: mean(sum_pred),
            mean_actual: mean(sum_act),
            entries_by_type,
            actual_source_by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PredictionSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_prediction(value: f64) -> NewPrediction {
        NewPrediction {
            service_name: "svc".into(),
            model_id: "quality".into(),
            prediction_type: "quality".into(),
            predicted_value: value,
            confidence: 0.9,
            context: json!({"text": "hello"}),
            model_version: "v1".into(),
            source: PredictionSource::Model,
            members: Vec::new(),
        }
    }

    fn settings() -> FeedbackSettings {
        FeedbackSettings {
            retry_base_ms: 1,
            max_retries: 2,
            ..FeedbackSettings::default()
        }
    }

    fn collector() -> (Arc<MemoryStore>, FeedbackCollector) {
        let store = Arc::new(MemoryStore::new());
        let c = FeedbackCollector::new(store.clone(), settings());
        (store, c)
    }

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
        seen: parking_lot::Mutex<Vec<(Option<f64>, f64)>>,
    }

    #[async_trait]
    impl OutcomeSink for CountingSink {
        async fn on_outcome(&self, event: &OutcomeEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((event.previous, event.actual));
        }
    }

    #[tokio::test]
    async fn test_write_prediction_only_enqueues() {
        let (store, c) = collector();
        c.write_prediction("p1", new_prediction(0.5));
        assert_eq!(store.prediction_count(), 0);
        assert_eq!(c.queue().len(), 1);
        let report = c.flush_queue().await.unwrap();
        assert_eq!(report.predictions_written, 1);
        assert_eq!(store.prediction_count(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_flushes_pending_prediction_first() {
        let (_store, c) = collector();
        c.write_prediction("p1", new_prediction(0.4));
        let receipt = c
            .record_outcome("p1", FeedbackType::User, 0.9, json!({}))
            .await
            .unwrap();
        assert_eq!(receipt.status, OutcomeStatus::Recorded);
        assert_eq!(receipt.actual_value, Some(0.9));
        assert!((receipt.error.unwrap() - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unknown_prediction_is_an_error() {
        let (_store, c) = collector();
        assert_eq!(
            c.record_outcome("ghost", FeedbackType::Bot, 1.0, json!({}))
                .await,
            Err(FeedbackError::UnknownPrediction("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_invalid_score_rejected() {
        let (_store, c) = collector();
        assert!(matches!(
            c.record_outcome("p", FeedbackType::User, 1.5, json!({})).await,
            Err(FeedbackError::InvalidScore(_))
        ));
    }

    #[tokio::test]
    async fn test_resubmission_replaces_entry_and_notifies_on_change() {
        let (store, c) = collector();
        let sink = Arc::new(CountingSink::default());
        c.add_sink(sink.clone());
        c.write_prediction("p1", new_prediction(0.5));

        let first = c
            .record_outcome("p1", FeedbackType::Survey, 0.6, json!({}))
            .await
            .unwrap();
        let second = c
            .record_outcome("p1", FeedbackType::Survey, 0.7, json!({}))
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.actual_value, Some(0.7));
        assert_eq!(store.feedback_count(), 1);
        assert_eq!(*sink.seen.lock(), vec![(None, 0.6), (Some(0.6), 0.7)]);

        // Same value again: nothing changed, nothing to relearn.
        c.record_outcome("p1", FeedbackType::Survey, 0.7, json!({}))
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_higher_priority_revision_reaches_sinks() {
        let (store, c) = collector();
        let sink = Arc::new(CountingSink::default());
        c.add_sink(sink.clone());
        c.write_prediction("p1", new_prediction(0.5));

        c.record_outcome("p1", FeedbackType::User, 0.2, json!({}))
            .await
            .unwrap();
        c.record_outcome("p1", FeedbackType::Bot, 1.0, json!({}))
            .await
            .unwrap();
        let stored = store.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(stored.actual_value, Some(1.0));
        assert_eq!(*sink.seen.lock(), vec![(None, 0.2), (Some(0.2), 1.0)]);

        // A later low-priority rating does not move the reconciled actual.
        c.record_outcome("p1", FeedbackType::User, 0.4, json!({}))
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_higher_priority_source_wins() {
        let (store, c) = collector();
        c.write_prediction("p1", new_prediction(0.5));
        c.record_outcome("p1", FeedbackType::Bot, 1.0, json!({}))
            .await
            .unwrap();
        let receipt = c
            .record_outcome("p1", FeedbackType::User, 0.2, json!({}))
            .await
            .unwrap();
        assert_eq!(receipt.actual_value, Some(1.0));
        let stored = store.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(stored.actual_source, Some(FeedbackType::Bot));
    }

    #[tokio::test]
    async fn test_outcome_queued_while_store_down_then_applied() {
        let (store, c) = collector();
        let sink = Arc::new(CountingSink::default());
        c.add_sink(sink.clone());
        c.write_prediction("p1", new_prediction(0.5));
        c.flush_queue().await.unwrap();

        store.set_available(false);
        let receipt = c
            .record_outcome("p1", FeedbackType::Bot, 0.0, json!({}))
            .await
            .unwrap();
        assert_eq!(receipt.status, OutcomeStatus::Queued);
        assert_eq!(c.queue().len(), 1);
        assert!(c.flush_queue().await.is_err());
        assert_eq!(c.queue().len(), 1);

        store.set_available(true);
        let report = c.flush_queue().await.unwrap();
        assert_eq!(report.outcomes_applied, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        let stored = store.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(stored.actual_value, Some(0.0));
    }

    #[tokio::test]
    async fn test_reads_report_unavailable() {
        let (store, c) = collector();
        store.set_available(false);
        assert!(matches!(
            c.get_feedback_stats(None, 7).await,
            ReadResult::Unavailable { .. }
        ));
        assert!(!c.get_predictions_needing_feedback(None, 10).await.is_available());
        assert!(!c.monitor_feedback_collection(None, None).await.is_available());
    }

    #[tokio::test]
    async fn test_stats_and_monitoring() {
        let (_store, c) = collector();
        for i in 0..4 {
            c.write_prediction(format!("p{i}"), new_prediction(0.5));
        }
        c.flush_queue().await.unwrap();
        c.collect_user_feedback("p0", 4.0, Some("nice")).await.unwrap();

        let stats = c.get_feedback_stats(Some("svc"), 7).await.into_option().unwrap();
        assert_eq!(stats.total_predictions, 4);
        assert_eq!(stats.with_outcome, 1);
        assert!((stats.feedback_rate_pct - 25.0).abs() < 1e-9);
        assert_eq!(stats.entries_by_type.get("user"), Some(&1));

        let pending = c
            .get_predictions_needing_feedback(Some("svc"), 10)
            .await
            .into_option()
            .unwrap();
        assert_eq!(pending.len(), 3);

        let health = c.monitor_feedback_collection(None, None).await.into_option().unwrap();
        assert!(!health.alert);
        let strict = c
            .monitor_feedback_collection(Some("svc"), Some(50.0))
            .await
            .into_option()
            .unwrap();
        assert!(strict.alert);
    }

    #[tokio::test]
    async fn test_collect_helpers_normalise() {
        let (_store, c) = collector();
        c.write_prediction("p1", new_prediction(0.5));
        let r = c
            .collect_comment_feedback("p1", "great", "very-positive", None)
            .await
            .unwrap();
        assert_eq!(r.score, 0.9);
        let r = c
            .collect_ai_system_feedback("p1", "poor", None, json!({}))
            .await
            .unwrap();
        assert_eq!(r.score, 0.2);
        let r = c
            .collect_bot_feedback("p1", json!("success"), json!({}))
            .await
            .unwrap();
        assert_eq!(r.actual_value, Some(1.0));
        assert!(matches!(
            c.submit_outcome("p1", FeedbackType::Survey, json!({"responses": ["x"]}))
                .await,
            Err(FeedbackError::Unnormalizable { .. })
        ));
    }

    #[tokio::test]
    async fn test_flusher_drains_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let c = Arc::new(FeedbackCollector::new(
            store.clone(),
            FeedbackSettings {
                flush_interval_ms: 60_000,
                ..settings()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = c.spawn_flusher(rx);
        c.write_prediction("p1", new_prediction(0.5));
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.prediction_count(), 1);
    }
}
