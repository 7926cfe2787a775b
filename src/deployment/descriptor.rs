//! Model version descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::training::ModelMetrics;

/// Lifecycle status of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Trained, not yet taking full traffic.
    Staged,
    /// Serving.
    Active,
    /// Out of rotation; kept for audit and rollback.
    Retired,
}

/// One version of one lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Lineage id.
    pub model_id: String,
    /// Version tag, unique within the lineage.
    pub version: String,
    /// Registry key of the serving backend.
    pub backend: String,
    /// Where the trained artifact lives, if any.
    pub artifact_location: Option<String>,
    /// SHA-256 of the artifact when it was stored.
    pub artifact_checksum: Option<String>,
    /// Share of the lineage's traffic, `0..=100`.
    pub traffic_percentage: u8,
    /// Lifecycle status.
    pub status: ModelStatus,
    /// Offline evaluation metrics.
    pub metrics: Option<ModelMetrics>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// When the version last started taking traffic.
    pub deployed_at: Option<DateTime<Utc>>,
}

impl ModelDescriptor {
    /// Fresh staged descriptor with no traffic.
    pub fn staged(
        model_id: impl Into<String>,
        version: impl Into<String>,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            version: version.into(),
            backend: backend.into(),
            artifact_location: None,
            artifact_checksum: None,
            traffic_percentage: 0,
            status: ModelStatus::Staged,
            metrics: None,
            created_at: Utc::now(),
            deployed_at: None,
        }
    }

    /// Set traffic and stamp `deployed_at` when it becomes non-zero.
    pub(crate) fn set_traffic(&mut self, pct: u8) {
        if pct > 0 && self.traffic_percentage == 0 {
            self.deployed_at = Some(Utc::now());
        }
        self.traffic_percentage = pct.min(100);
    }
}
