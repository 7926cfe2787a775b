//! Bounded in-memory write queue between the serving path and the store.
//!
//! ## Guarantees
//! - Bounded: at most `capacity` items; on overflow the oldest item is dropped
//!   and counted
//! - FIFO: items drain in arrival order; requeued items go back to the front
//! - Non-blocking: `push` never awaits

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::warn;

use super::record::{FeedbackEntry, PredictionRecord};
use crate::metrics;

/// A write waiting for the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// A served prediction.
    Prediction(PredictionRecord),
    /// Feedback that could not be applied while the store was down.
    Outcome(FeedbackEntry),
}

impl PendingWrite {
    /// Prediction id this write belongs to.
    pub fn prediction_id(&self) -> &str {
        match self {
            PendingWrite::Prediction(r) => &r.id,
            PendingWrite::Outcome(e) => &e.prediction_id,
        }
    }
}

/// Drop-oldest bounded queue with a flush wake-up signal.
pub struct WriteQueue {
    items: Mutex<VecDeque<PendingWrite>>,
    capacity: usize,
    wake_at: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl WriteQueue {
    /// Queue holding at most `capacity` items. Reaching `wake_at` items wakes
    /// the flusher early.
    pub fn new(capacity: usize, wake_at: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            wake_at: wake_at.clamp(1, capacity),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Append an item, dropping the oldest on overflow. Returns how many items
    /// were dropped.
    pub fn push(&self, item: PendingWrite) -> usize {
        let (depth, dropped) = {
            let mut items = self.items.lock();
            items.push_back(item);
            let dropped = self.trim(&mut items);
            (items.len(), dropped)
        };
        self.after_change(depth, dropped);
        if depth >= self.wake_at {
            self.notify.notify_one();
        }
        dropped
    }

    /// Put items back at the front, preserving their order.
    pub fn requeue_front(&self, batch: Vec<PendingWrite>) -> usize {
        let (depth, dropped) = {
            let mut items = self.items.lock();
            for item in batch.into_iter().rev() {
                items.push_front(item);
            }
            let dropped = self.trim(&mut items);
            (items.len(), dropped)
        };
        self.after_change(depth, dropped);
        dropped
    }

    /// Remove up to `max` items from the front.
    pub fn drain(&self, max: usize) -> Vec<PendingWrite> {
        let (batch, depth) = {
            let mut items = self.items.lock();
            let n = max.min(items.len());
            let batch: Vec<PendingWrite> = items.drain(..n).collect();
            (batch, items.len())
        };
        metrics::set_feedback_queue_depth(depth);
        batch
    }

    /// Whether a prediction with `id` is still waiting.
    pub fn contains_prediction(&self, id: &str) -> bool {
        self.items
            .lock()
            .iter()
            .any(|i| matches!(i, PendingWrite::Prediction(r) if r.id == id))
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum depth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items dropped on overflow since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves when the queue crosses its wake threshold.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn trim(&self, items: &mut VecDeque<PendingWrite>) -> usize {
        let mut dropped = 0;
        while items.len() > self.capacity {
            if let Some(old) = items.pop_front() {
                warn!(
                    prediction_id = old.prediction_id(),
                    "feedback queue full, dropping oldest write"
                );
            }
            dropped += 1;
        }
        dropped
    }

    fn after_change(&self, depth: usize, dropped: usize) {
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            metrics::inc_feedback_dropped(dropped as u64);
        }
        metrics::set_feedback_queue_depth(depth);
    }
}
