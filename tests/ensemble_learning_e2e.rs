//! # Ensemble Learning End to End
//!
//! Predictions flow through the router, outcomes come back through the
//! feedback collector, and the learning loop shifts ensemble weight toward
//! the member with the lower error.

use std::sync::Arc;

use serde_json::json;
use tokio_prediction_orchestrator::config::{BackendConfig, BackendKind, RouteConfig, ServingConfig};
use tokio_prediction_orchestrator::training::{ExportFormat, PipelineState};
use tokio_prediction_orchestrator::{FeedbackType, PredictionRequest, ServingCore};

const ACTUAL: f64 = 0.35;

fn config() -> ServingConfig {
    let mut config = ServingConfig::default();
    config.recovery.enabled = false;
    config.training.auto_train = false;
    for (name, value) in [("close", 0.3), ("far", 0.8)] {
        config.backends.push(BackendConfig {
            name: name.into(),
            version: "v1".into(),
            kind: BackendKind::Static {
                value,
                confidence: 0.9,
            },
        });
    }
    config.routes.insert(
        "quality".into(),
        RouteConfig {
            members: vec!["close".into(), "far".into()],
            fallback: None,
            strategy: None,
        },
    );
    config
}

#[tokio::test]
async fn test_lower_error_member_gains_weight() {
    let core = Arc::new(ServingCore::from_config(config()).await.unwrap());

    let before = core.ensemble.normalized_weights(&["close", "far"]);
    assert!((before[0] - before[1]).abs() < 1e-9);

    let mut ids = Vec::new();
    for i in 0..60 {
        let out = core
            .predict("quality", &PredictionRequest::new(json!({"text": format!("item {i}")})))
            .await
            .unwrap();
        assert_eq!(out.members.len(), 2);
        ids.push(out.prediction_id);
    }
    core.feedback.flush_queue().await.unwrap();

    for id in &ids {
        let receipt = core
            .feedback
            .submit_outcome(id, FeedbackType::AiSystem, json!(ACTUAL))
            .await
            .unwrap();
        assert_eq!(receipt.actual_value, Some(ACTUAL));
    }

    let after = core.ensemble.normalized_weights(&["close", "far"]);
    assert!(
        after[0] > after[1],
        "close={} far={} should favour the closer member",
        after[0],
        after[1]
    );

    let learning = core.learning.stats();
    assert_eq!(learning.outcomes, 60);
    assert_eq!(learning.ensemble_updates, 60);
    assert_eq!(learning.examples, 120);
    assert_eq!(core.pipeline.state("close"), PipelineState::ThresholdReached);
    assert_eq!(core.pipeline.state("far"), PipelineState::ThresholdReached);

    // A fresh request now leans toward the closer member.
    let next = core
        .predict("quality", &PredictionRequest::new(json!({"text": "after learning"})))
        .await
        .unwrap();
    assert!(next.value < 0.55, "combined value {} did not move", next.value);
}

#[tokio::test]
async fn test_higher_priority_label_replaces_user_rating() {
    let core = ServingCore::from_config(config()).await.unwrap();
    let out = core
        .predict("quality", &PredictionRequest::new(json!({"text": "once"})))
        .await
        .unwrap();

    core.feedback
        .submit_outcome(&out.prediction_id, FeedbackType::User, json!(0.2))
        .await
        .unwrap();
    let after_user = core.ensemble.normalized_weights(&["close", "far"]);
    assert!(after_user[0] > after_user[1]);

    // The bot's verdict outranks the rating; everything relearns from it.
    let receipt = core
        .feedback
        .submit_outcome(&out.prediction_id, FeedbackType::Bot, json!("success"))
        .await
        .unwrap();
    assert_eq!(receipt.actual_value, Some(1.0));

    let after_bot = core.ensemble.normalized_weights(&["close", "far"]);
    assert!(
        after_bot[1] > after_user[1],
        "far={} should gain once the actual is 1.0",
        after_bot[1]
    );

    let learning = core.learning.stats();
    assert_eq!(learning.outcomes, 2);
    assert_eq!(learning.revisions, 1);
    assert_eq!(learning.ensemble_updates, 2);

    for lineage in ["close", "far"] {
        let snapshot = core.pipeline.snapshot(lineage).unwrap();
        assert_eq!(snapshot.examples, 1);
        let rows: serde_json::Value =
            serde_json::from_str(&core.pipeline.export_dataset(lineage, ExportFormat::Json).unwrap())
                .unwrap();
        assert_eq!(rows[0]["actual"], 1.0);
    }

    // A later rating cannot outvote the bot, so nothing is relearned.
    core.feedback
        .submit_outcome(&out.prediction_id, FeedbackType::User, json!(0.3))
        .await
        .unwrap();
    assert_eq!(core.learning.stats().outcomes, 2);
}
