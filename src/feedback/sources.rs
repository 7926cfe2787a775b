//! Normalising raw feedback from each source kind onto `[0, 1]`.
//!
//! Ratings on a 1–5 scale are divided by 5. Categorical labels map through
//! fixed tables. Anything that cannot be mapped yields `None` and the caller
//! rejects it.

use serde_json::Value;

use super::record::FeedbackType;

/// Rating to score: values in `[0, 1]` pass through, `(1, 5]` is divided by 5.
pub fn normalize_rating(rating: f64) -> Option<f64> {
    if !rating.is_finite() || rating < 0.0 {
        return None;
    }
    if rating <= 1.0 {
        Some(rating)
    } else if rating <= 5.0 {
        Some(rating / 5.0)
    } else {
        None
    }
}

/// Bot outcome: success is 1, failure is 0, numbers are treated as ratings.
pub fn bot_outcome_score(outcome: &Value) -> Option<f64> {
    match outcome {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().and_then(normalize_rating),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "resolved" | "pass" | "passed" => Some(1.0),
            "failure" | "failed" | "fail" | "unresolved" => Some(0.0),
            "partial" => Some(0.5),
            other => other.parse::<f64>().ok().and_then(normalize_rating),
        },
        Value::Object(map) => map
            .get("outcome")
            .or_else(|| map.get("score"))
            .and_then(bot_outcome_score),
        _ => None,
    }
}

/// Survey: explicit rating wins; otherwise the mean of numeric responses / 5.
pub fn survey_score(responses: &[Value], rating: Option<f64>) -> Option<f64> {
    if let Some(r) = rating {
        return normalize_rating(r);
    }
    let numeric: Vec<f64> = responses
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|v| v.is_finite())
        .collect();
    if numeric.is_empty() {
        return None;
    }
    let mean = numeric.iter().sum::<f64>() / numeric.len() as f64;
    Some((mean / 5.0).clamp(0.0, 1.0))
}

/// Comment sentiment label to score. Unknown labels are neutral.
pub fn sentiment_score(sentiment: &str) -> f64 {
    match sentiment.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "very-positive" => 0.9,
        "positive" => 0.8,
        "negative" => 0.2,
        "very-negative" => 0.1,
        _ => 0.5,
    }
}

/// AI evaluator verdict to score. Unknown verdicts are neutral.
pub fn evaluation_score(evaluation: &str) -> f64 {
    match evaluation.trim().to_ascii_lowercase().as_str() {
        "excellent" => 0.9,
        "good" | "success" => 0.8,
        "poor" | "failure" => 0.2,
        "bad" => 0.1,
        _ => 0.5,
    }
}

/// Normalise an arbitrary JSON payload submitted for `feedback_type`.
///
/// Accepted shapes:
/// - a bare number (rating)
/// - a string (bot outcome, comment sentiment or AI verdict)
/// - an object with `rating`, `score`, `outcome`, `responses`, `sentiment`
///   or `evaluation`, depending on the type
pub fn normalize_payload(feedback_type: FeedbackType, payload: &Value) -> Option<f64> {
    if let Some(n) = payload.as_f64() {
        return normalize_rating(n);
    }
    let field_rating = |key: &str| payload.get(key).and_then(Value::as_f64);
    match feedback_type {
        FeedbackType::User => field_rating("rating")
            .or_else(|| field_rating("score"))
            .and_then(normalize_rating),
        FeedbackType::Bot => bot_outcome_score(payload),
        FeedbackType::Survey => {
            let responses: Vec<Value> = match payload.get("responses") {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Object(map)) => map.values().cloned().collect(),
                _ => Vec::new(),
            };
            survey_score(&responses, field_rating("rating"))
        }
        FeedbackType::Comment => {
            if let Some(r) = field_rating("rating") {
                return normalize_rating(r);
            }
            match payload {
                Value::String(s) => Some(sentiment_score(s)),
                _ => payload
                    .get("sentiment")
                    .and_then(Value::as_str)
                    .map(sentiment_score),
            }
        }
        FeedbackType::AiSystem => {
            if let Some(s) = field_rating("score") {
                return normalize_rating(s);
            }
            match payload {
                Value::String(s) => Some(evaluation_score(s)),
                _ => payload
                    .get("evaluation")
                    .and_then(Value::as_str)
                    .map(evaluation_score),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rating_scales() {
        assert_eq!(normalize_rating(0.7), Some(0.7));
        assert_eq!(normalize_rating(4.0), Some(0.8));
        assert_eq!(normalize_rating(6.0), None);
        assert_eq!(normalize_rating(f64::NAN), None);
        assert_eq!(normalize_rating(-1.0), None);
    }

    #[test]
    fn test_bot_outcomes() {
        assert_eq!(bot_outcome_score(&json!("success")), Some(1.0));
        assert_eq!(bot_outcome_score(&json!("FAILED")), Some(0.0));
        assert_eq!(bot_outcome_score(&json!(true)), Some(1.0));
        assert_eq!(bot_outcome_score(&json!({"outcome": "failure"})), Some(0.0));
        assert_eq!(bot_outcome_score(&json!("sideways")), None);
    }

    #[test]
    fn test_survey_averages_responses() {
        let score = survey_score(&[json!(4), json!("5"), json!("n/a")], None).unwrap();
        assert!((score - 0.9).abs() < 1e-12);
        assert_eq!(survey_score(&[json!(1)], Some(0.3)), Some(0.3));
        assert_eq!(survey_score(&[json!("nope")], None), None);
    }

    #[test]
    fn test_label_tables() {
        assert_eq!(sentiment_score("Very_Positive"), 0.9);
        assert_eq!(sentiment_score("negative"), 0.2);
        assert_eq!(sentiment_score("meh"), 0.5);
        assert_eq!(evaluation_score("excellent"), 0.9);
        assert_eq!(evaluation_score("failure"), 0.2);
        assert_eq!(evaluation_score("bad"), 0.1);
        assert_eq!(evaluation_score("unsure"), 0.5);
    }

    #[test]
    fn test_normalize_payload_by_type() {
        assert_eq!(
            normalize_payload(FeedbackType::User, &json!({"rating": 5})),
            Some(1.0)
        );
        assert_eq!(
            normalize_payload(FeedbackType::Comment, &json!({"sentiment": "positive"})),
            Some(0.8)
        );
        assert_eq!(
            normalize_payload(FeedbackType::AiSystem, &json!("good")),
            Some(0.8)
        );
        assert_eq!(
            normalize_payload(FeedbackType::Survey, &json!({"responses": {"q1": 3, "q2": 5}})),
            Some(0.8)
        );
        assert_eq!(normalize_payload(FeedbackType::Bot, &json!(0.25)), Some(0.25));
        assert_eq!(normalize_payload(FeedbackType::User, &json!({"text": "hi"})), None);
    }
}
