//! Persistence contract for predictions and feedback, plus the in-memory
//! implementation.
//!
//! Any durable backend (SQL, document store, …) plugs in by implementing
//! [`PredictionStore`]. The serving path never calls the store directly; only
//! the feedback collector's flusher and outcome path do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

use super::record::{FeedbackEntry, FeedbackType, PredictionRecord};

/// Store failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The backend is unreachable; the operation may be retried later.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    /// No prediction with this id exists.
    #[error("prediction not found: {0}")]
    NotFound(String),
}

/// Opaque store with insert / update / select-by-id / select-by-time-range.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Insert a batch of predictions. Ids already present are left untouched,
    /// so replays after a partial failure are harmless.
    async fn insert_predictions(&self, records: &[PredictionRecord]) -> Result<(), StoreError>;

    /// Fetch one prediction.
    async fn get_prediction(&self, id: &str) -> Result<Option<PredictionRecord>, StoreError>;

    /// Write the reconciled outcome of a prediction.
    async fn update_actual(
        &self,
        id: &str,
        actual: f64,
        error: f64,
        source: FeedbackType,
    ) -> Result<(), StoreError>;

    /// Insert or replace the entry for `(prediction_id, feedback_type)`.
    /// Returns `true` when a new entry was created.
    async fn upsert_feedback(&self, entry: &FeedbackEntry) -> Result<bool, StoreError>;

    /// Every feedback entry of a prediction.
    async fn feedback_for(&self, prediction_id: &str) -> Result<Vec<FeedbackEntry>, StoreError>;

    /// Predictions created in `[from, to)`, optionally for one service.
    async fn predictions_between(
        &self,
        service: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PredictionRecord>, StoreError>;

    /// Newest predictions without an outcome, at most `limit`.
    async fn unresolved_predictions(
        &self,
        service: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, StoreError>;
}

#[derive(Default)]
struct Tables {
    predictions: HashMap<String, PredictionRecord>,
    feedback: HashMap<(String, FeedbackType), FeedbackEntry>,
}

/// In-process store. Availability can be toggled to exercise degraded paths.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
    insert_batches: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty, available store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
            insert_batches: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `insert_predictions` calls.
    pub fn insert_batches(&self) -> u64 {
        self.insert_batches.load(Ordering::SeqCst)
    }

    /// Stored prediction count.
    pub fn prediction_count(&self) -> usize {
        self.tables.read().predictions.len()
    }

    /// Stored feedback entry count.
    pub fn feedback_count(&self) -> usize {
        self.tables.read().feedback.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

fn matches_service(record: &PredictionRecord, service: Option<&str>) -> bool {
    service.map_or(true, |s| record.service_name == s)
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn insert_predictions(&self, records: &[PredictionRecord]) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        for record in records {
            tables
                .predictions
                .entry(record.id.clone())
                .or_insert_with(|| record.clone());
        }
        self.insert_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_prediction(&self, id: &str) -> Result<Option<PredictionRecord>, StoreError> {
        self.check()?;
        Ok(self.tables.read().predictions.get(id).cloned())
    }

    async fn update_actual(
        &self,
        id: &str,
        actual: f64,
        error: f64,
        source: FeedbackType,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let record = tables
            .predictions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.actual_value = Some(actual);
        record.error = Some(error);
        record.actual_source = Some(source);
        record.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn upsert_feedback(&self, entry: &FeedbackEntry) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if !tables.predictions.contains_key(&entry.prediction_id) {
            return Err(StoreError::NotFound(entry.prediction_id.clone()));
        }
        let previous = tables.feedback.insert(
            (entry.prediction_id.clone(), entry.feedback_type),
            entry.clone(),
        );
        Ok(previous.is_none())
    }

    async fn feedback_for(&self, prediction_id: &str) -> Result<Vec<FeedbackEntry>, StoreError> {
        self.check()?;
        let tables = self.tables.read();
        let mut entries: Vec<FeedbackEntry> = FeedbackType::ALL
            .iter()
            .filter_map(|t| tables.feedback.get(&(prediction_id.to_string(), *t)).cloned())
            .collect();
        entries.sort_by_key(|e| e.recorded_at);
        Ok(entries)
    }

    async fn predictions_between(
        &self,
        service: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PredictionRecord>, StoreError> {
        self.check()?;
        let tables = self.tables.read();
        let mut records: Vec<PredictionRecord> = tables
            .predictions
            .values()
            .filter(|r| r.created_at >= from && r.created_at < to && matches_service(r, service))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn unresolved_predictions(
        &self,
        service: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, StoreError> {
        self.check()?;
        let tables = self.tables.read();
        let mut records: Vec<PredictionRecord> = tables
            .predictions
            .values()
            .filter(|r| !r.is_resolved() && matches_service(r, service))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::record::NewPrediction;
    use crate::PredictionSource;
    use serde_json::json;

    fn record(id: &str, service: &str) -> PredictionRecord {
        PredictionRecord::from_new(
            id.to_string(),
            NewPrediction {
                service_name: service.to_string(),
                model_id: "quality".to_string(),
                prediction_type: "quality".to_string(),
                predicted_value: 0.6,
                confidence: 0.9,
                context: json!({}),
                model_version: "v1".to_string(),
                source: PredictionSource::Model,
                members: Vec::new(),
            },
        )
    }

    fn entry(id: &str, t: FeedbackType, score: f64) -> FeedbackEntry {
        FeedbackEntry {
            prediction_id: id.to_string(),
            feedback_type: t,
            score,
            raw: json!(score),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_id() {
        let store = MemoryStore::new();
        store.insert_predictions(&[record("p1", "svc")]).await.unwrap();
        store
            .update_actual("p1", 0.9, 0.3, FeedbackType::Bot)
            .await
            .unwrap();
        store.insert_predictions(&[record("p1", "svc")]).await.unwrap();
        let stored = store.get_prediction("p1").await.unwrap().unwrap();
        assert_eq!(stored.actual_value, Some(0.9));
        assert_eq!(store.prediction_count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_feedback_reports_creation() {
        let store = MemoryStore::new();
        store.insert_predictions(&[record("p1", "svc")]).await.unwrap();
        assert!(store
            .upsert_feedback(&entry("p1", FeedbackType::User, 0.4))
            .await
            .unwrap());
        assert!(!store
            .upsert_feedback(&entry("p1", FeedbackType::User, 0.8))
            .await
            .unwrap());
        let entries = store.feedback_for("p1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].score, 0.8);
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_prediction_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .upsert_feedback(&entry("missing", FeedbackType::Bot, 1.0))
                .await,
            Err(StoreError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_errors_everywhere() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_prediction("x").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.insert_predictions(&[record("p", "s")]).await.is_err());
        assert!(store.unresolved_predictions(None, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_unresolved_filters_by_service_and_limit() {
        let store = MemoryStore::new();
        store
            .insert_predictions(&[record("a", "s1"), record("b", "s1"), record("c", "s2")])
            .await
            .unwrap();
        store
            .update_actual("a", 0.5, 0.1, FeedbackType::User)
            .await
            .unwrap();
        let pending = store.unresolved_predictions(Some("s1"), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
        assert_eq!(store.unresolved_predictions(None, 1).await.unwrap().len(), 1);
    }
}
