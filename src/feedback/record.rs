//! Persistent record types for predictions and their feedback.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ensemble::MemberPrediction;
use crate::PredictionSource;

/// Who or what supplied a piece of feedback.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackType {
    /// Raw rating from an end user.
    User,
    /// Automated bot that observed the real outcome.
    Bot,
    /// Automated AI evaluator.
    AiSystem,
    /// Structured survey response.
    Survey,
    /// Free-text comment scored by sentiment.
    Comment,
}

impl FeedbackType {
    /// All feedback types.
    pub const ALL: [FeedbackType; 5] = [
        FeedbackType::User,
        FeedbackType::Bot,
        FeedbackType::AiSystem,
        FeedbackType::Survey,
        FeedbackType::Comment,
    ];

    /// Wire name (`"ai-system"`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::User => "user",
            FeedbackType::Bot => "bot",
            FeedbackType::AiSystem => "ai-system",
            FeedbackType::Survey => "survey",
            FeedbackType::Comment => "comment",
        }
    }

    /// Parse a wire name; accepts `ai_system` as well.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(FeedbackType::User),
            "bot" => Some(FeedbackType::Bot),
            "ai-system" | "ai_system" | "ai" => Some(FeedbackType::AiSystem),
            "survey" => Some(FeedbackType::Survey),
            "comment" => Some(FeedbackType::Comment),
            _ => None,
        }
    }
}

impl fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the router knows about a prediction at serve time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    /// Issuing service.
    pub service_name: String,
    /// Routed model id.
    pub model_id: String,
    /// Kind of score predicted.
    pub prediction_type: String,
    /// Served value.
    pub predicted_value: f64,
    /// Served confidence.
    pub confidence: f64,
    /// Request payload and routing context.
    pub context: serde_json::Value,
    /// Version tag of the serving model set.
    pub model_version: String,
    /// Which path produced the answer.
    pub source: PredictionSource,
    /// Member predictions behind the answer.
    pub members: Vec<MemberPrediction>,
}

/// A stored prediction.
///
/// Immutable once written except for the outcome fields, which only
/// reconciliation writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Prediction id handed back to the caller.
    pub id: String,
    /// Issuing service.
    pub service_name: String,
    /// Routed model id.
    pub model_id: String,
    /// Kind of score predicted.
    pub prediction_type: String,
    /// Served value.
    pub predicted_value: f64,
    /// Served confidence.
    pub confidence: f64,
    /// Request payload and routing context.
    pub context: serde_json::Value,
    /// Version tag of the serving model set.
    pub model_version: String,
    /// Which path produced the answer.
    pub source: PredictionSource,
    /// Member predictions behind the answer.
    pub members: Vec<MemberPrediction>,
    /// Serve time.
    pub created_at: DateTime<Utc>,
    /// Reconciled ground truth.
    pub actual_value: Option<f64>,
    /// `|predicted_value - actual_value|`.
    pub error: Option<f64>,
    /// Feedback type whose score became `actual_value`.
    pub actual_source: Option<FeedbackType>,
    /// When `actual_value` was last written.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PredictionRecord {
    /// Stamp a new prediction with `id` and the current time.
    pub fn from_new(id: String, new: NewPrediction) -> Self {
        Self {
            id,
            service_name: new.service_name,
            model_id: new.model_id,
            prediction_type: new.prediction_type,
            predicted_value: new.predicted_value,
            confidence: new.confidence,
            context: new.context,
            model_version: new.model_version,
            source: new.source,
            members: new.members,
            created_at: Utc::now(),
            actual_value: None,
            error: None,
            actual_source: None,
            resolved_at: None,
        }
    }

    /// Whether a ground truth has been reconciled.
    pub fn is_resolved(&self) -> bool {
        self.actual_value.is_some()
    }
}

/// One normalised piece of feedback. Unique per `(prediction_id, feedback_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    /// Prediction the feedback refers to.
    pub prediction_id: String,
    /// Feedback source kind.
    pub feedback_type: FeedbackType,
    /// Score normalised into `[0, 1]`.
    pub score: f64,
    /// Original payload, kept for audit.
    pub raw: serde_json::Value,
    /// Submission time; resubmissions overwrite it.
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&FeedbackType::AiSystem).unwrap(),
            "\"ai-system\""
        );
        assert_eq!(FeedbackType::parse("AI_SYSTEM"), Some(FeedbackType::AiSystem));
        assert_eq!(FeedbackType::parse("survey"), Some(FeedbackType::Survey));
        assert_eq!(FeedbackType::parse("unknown"), None);
        assert_eq!(FeedbackType::Comment.to_string(), "comment");
    }
}
