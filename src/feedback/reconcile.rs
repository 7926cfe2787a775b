//! Choosing the ground truth when several feedback sources disagree.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::record::{FeedbackEntry, FeedbackType};

/// Source priority map. Higher wins; equal priorities fall back to the most
/// recent entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ReconciliationPolicy {
    priorities: BTreeMap<FeedbackType, u8>,
}

impl Default for ReconciliationPolicy {
    /// bot = ai-system > survey > comment > user
    fn default() -> Self {
        Self {
            priorities: BTreeMap::from([
                (FeedbackType::Bot, 4),
                (FeedbackType::AiSystem, 4),
                (FeedbackType::Survey, 3),
                (FeedbackType::Comment, 2),
                (FeedbackType::User, 1),
            ]),
        }
    }
}

impl ReconciliationPolicy {
    /// Policy from explicit priorities; types left out get priority 0.
    pub fn new(priorities: BTreeMap<FeedbackType, u8>) -> Self {
        Self { priorities }
    }

    /// Priority of `feedback_type`.
    pub fn priority(&self, feedback_type: FeedbackType) -> u8 {
        self.priorities.get(&feedback_type).copied().unwrap_or(0)
    }

    /// The entry whose score becomes the actual value, if any.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn reconcile<'a>(&self, entries: &'a [FeedbackEntry]) -> Option<&'a FeedbackEntry> {
        entries.iter().max_by(|a, b| {
            self.priority(a.feedback_type)
                .cmp(&self.priority(b.feedback_type))
                .then(a.recorded_at.cmp(&b.recorded_at))
                .then(a.feedback_type.cmp(&b.feedback_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn entry(t: FeedbackType, score: f64, age_secs: i64) -> FeedbackEntry {
        FeedbackEntry {
            prediction_id: "p".into(),
            feedback_type: t,
            score,
            raw: json!(score),
            recorded_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_bot_beats_user_regardless_of_order() {
        let policy = ReconciliationPolicy::default();
        let entries = vec![
            entry(FeedbackType::Bot, 1.0, 10),
            entry(FeedbackType::User, 0.2, 0),
        ];
        assert_eq!(
            policy.reconcile(&entries).map(|e| e.feedback_type),
            Some(FeedbackType::Bot)
        );
    }

    #[test]
    fn test_equal_priority_prefers_most_recent() {
        let policy = ReconciliationPolicy::default();
        let entries = vec![
            entry(FeedbackType::AiSystem, 0.9, 0),
            entry(FeedbackType::Bot, 0.0, 30),
        ];
        assert_eq!(policy.reconcile(&entries).map(|e| e.score), Some(0.9));
    }

    #[test]
    fn test_full_ordering() {
        let policy = ReconciliationPolicy::default();
        assert!(policy.priority(FeedbackType::Survey) > policy.priority(FeedbackType::Comment));
        assert!(policy.priority(FeedbackType::Comment) > policy.priority(FeedbackType::User));
        assert!(policy.reconcile(&[]).is_none());
    }

    #[test]
    fn test_deserializes_from_map() {
        let policy: ReconciliationPolicy =
            serde_json::from_value(json!({"user": 9, "bot": 1})).unwrap();
        assert_eq!(policy.priority(FeedbackType::User), 9);
        assert_eq!(policy.priority(FeedbackType::Survey), 0);
    }
}
