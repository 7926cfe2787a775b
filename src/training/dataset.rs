//! Labeled examples, validation, the deterministic train/holdout split,
//! statistics and export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use super::TrainingError;

/// One resolved prediction of one lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    /// Prediction the label came from; drives the split.
    pub prediction_id: String,
    /// Lineage whose output `predicted` is.
    pub lineage: String,
    /// Version of the lineage that answered.
    pub version: String,
    /// Request payload and context.
    pub features: serde_json::Value,
    /// The lineage's own prediction.
    pub predicted: f64,
    /// Reconciled ground truth.
    pub actual: f64,
    /// When the label was reconciled.
    pub recorded_at: DateTime<Utc>,
}

impl LabeledExample {
    /// Example stamped with the current time.
    pub fn new(
        prediction_id: impl Into<String>,
        lineage: impl Into<String>,
        version: impl Into<String>,
        predicted: f64,
        actual: f64,
    ) -> Self {
        Self {
            prediction_id: prediction_id.into(),
            lineage: lineage.into(),
            version: version.into(),
            features: serde_json::Value::Null,
            predicted,
            actual,
            recorded_at: Utc::now(),
        }
    }

    /// Attach request features.
    pub fn with_features(mut self, features: serde_json::Value) -> Self {
        self.features = features;
        self
    }

    /// Both values finite and in `[0, 1]`.
    pub fn is_valid(&self) -> bool {
        [self.predicted, self.actual]
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

/// Drop malformed examples. Returns the clean set and the dropped count.
pub fn validate(examples: Vec<LabeledExample>) -> (Vec<LabeledExample>, usize) {
    let before = examples.len();
    let clean: Vec<LabeledExample> = examples.into_iter().filter(|e| e.is_valid()).collect();
    let dropped = before - clean.len();
    (clean, dropped)
}

/// Training and holdout partitions.
#[derive(Debug, Clone, Default)]
pub struct DatasetSplit {
    /// Fitting set.
    pub train: Vec<LabeledExample>,
    /// Evaluation set.
    pub holdout: Vec<LabeledExample>,
}

/// Bucket in `[0, 100)` derived from the prediction id.
pub fn split_bucket(prediction_id: &str) -> u8 {
    let digest = Sha256::digest(prediction_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

/// Deterministic split: an example is held out when its id bucket is below
/// `holdout_pct`. With two or more examples neither side is left empty.
pub fn split(examples: Vec<LabeledExample>, holdout_pct: u8) -> DatasetSplit {
    let (mut holdout, mut train): (Vec<_>, Vec<_>) = examples
        .into_iter()
        .partition(|e| split_bucket(&e.prediction_id) < holdout_pct);

    if train.len() + holdout.len() >= 2 {
        if holdout.is_empty() {
            if let Some(e) = train.pop() {
                holdout.push(e);
            }
        } else if train.is_empty() {
            if let Some(e) = holdout.pop() {
                train.push(e);
            }
        }
    }
    DatasetSplit { train, holdout }
}

/// Summary of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStatistics {
    /// Example count.
    pub count: usize,
    /// Mean predicted value.
    pub mean_predicted: f64,
    /// Mean actual value.
    pub mean_actual: f64,
    /// Standard deviation of actual values.
    pub std_actual: f64,
    /// Smallest actual value.
    pub min_actual: f64,
    /// Largest actual value.
    pub max_actual: f64,
    /// Mean absolute error of the recorded predictions.
    pub mae: f64,
}

/// Statistics over `examples`; `None` when empty.
pub fn statistics(examples: &[LabeledExample]) -> Option<DatasetStatistics> {
    if examples.is_empty() {
        return None;
    }
    let n = examples.len() as f64;
    let mean_predicted = examples.iter().map(|e| e.predicted).sum::<f64>() / n;
    let mean_actual = examples.iter().map(|e| e.actual).sum::<f64>() / n;
    let var = examples
        .iter()
        .map(|e| (e.actual - mean_actual).powi(2))
        .sum::<f64>()
        / n;
    Some(DatasetStatistics {
        count: examples.len(),
        mean_predicted,
        mean_actual,
        std_actual: var.sqrt(),
        min_actual: examples.iter().map(|e| e.actual).fold(f64::INFINITY, f64::min),
        max_actual: examples
            .iter()
            .map(|e| e.actual)
            .fold(f64::NEG_INFINITY, f64::max),
        mae: examples
            .iter()
            .map(|e| (e.predicted - e.actual).abs())
            .sum::<f64>()
            / n,
    })
}

/// Export encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Pretty JSON array.
    Json,
    /// Header plus one row per example; features are JSON-encoded.
    Csv,
}

/// Serialize `examples` in `format`.
///
/// # Errors
///
/// Returns [`TrainingError::Export`] if JSON encoding fails.
pub fn export(examples: &[LabeledExample], format: ExportFormat) -> Result<String, TrainingError> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(examples).map_err(|e| TrainingError::Export(e.to_string()))
        }
        ExportFormat::Csv => {
            let mut out =
                String::from("prediction_id,lineage,version,predicted,actual,recorded_at,features\n");
            for e in examples {
                let features = serde_json::to_string(&e.features)
                    .map_err(|err| TrainingError::Export(err.to_string()))?;
                let _ = writeln!(
                    out,
                    "{},{},{},{},{},{},{}",
                    csv_field(&e.prediction_id),
                    csv_field(&e.lineage),
                    csv_field(&e.version),
                    e.predicted,
                    e.actual,
                    e.recorded_at.to_rfc3339(),
                    csv_field(&features),
                );
            }
            Ok(out)
        }
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
