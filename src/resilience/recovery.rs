//! # Disaster Recovery
//!
//! ## Responsibility
//! Periodically capture everything needed to bring the serving state back
//! after a restart or a bad rollout: model descriptors, published traffic,
//! artifact references with their checksums, and ensemble weights.
//!
//! ## Guarantees
//! - Bounded: in-memory history capped at `max_snapshots`
//! - Versions are monotonic within a process and never reused
//! - Restores verify every artifact checksum and report mismatches instead of
//!   failing
//! - Snapshot files are written to a temporary name and renamed into place
//!
//! ## NOT Responsible For
//! - Re-creating backends that are not registered (they are reported)
//! - Restoring queued feedback (the store is the durable copy)

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deployment::{DeploymentManager, ModelDescriptor};
use crate::ensemble::{EnsemblePredictor, EnsembleSnapshot};
use crate::routing::table::{RoutingTableHandle, TrafficSlot};
use crate::training::ArtifactStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by disaster recovery.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecoveryError {
    /// An internal lock was poisoned by a panicking thread.
    #[error("recovery store lock poisoned")]
    LockPoisoned,

    /// The requested snapshot version does not exist.
    #[error("snapshot version {0} not found")]
    NotFound(u64),

    /// No snapshot has been taken or loaded.
    #[error("no snapshots available")]
    Empty,

    /// Reading or writing a snapshot file failed.
    #[error("snapshot I/O failed: {0}")]
    Io(String),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Settings and data
// ---------------------------------------------------------------------------

/// Recovery tuning (`[recovery]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RecoverySettings {
    /// Take periodic snapshots.
    pub enabled: bool,
    /// Seconds between periodic snapshots.
    pub interval_secs: u64,
    /// Snapshots kept in memory.
    pub max_snapshots: usize,
    /// Directory for snapshot files; memory only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_snapshots: 24,
            dir: None,
        }
    }
}

/// An artifact a descriptor points at, with its checksum at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Lineage.
    pub lineage: String,
    /// Version.
    pub version: String,
    /// Artifact location.
    pub location: String,
    /// Hex SHA-256 recorded when the artifact was stored.
    pub checksum: String,
}

/// Everything needed to restore serving state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    /// Monotonic version.
    pub version: u64,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Why it was taken.
    pub reason: String,
    /// Every descriptor, retired ones included.
    pub descriptors: Vec<ModelDescriptor>,
    /// Published traffic per lineage.
    pub traffic: BTreeMap<String, Vec<TrafficSlot>>,
    /// Artifacts referenced by descriptors.
    pub artifacts: Vec<ArtifactRecord>,
    /// Ensemble weights and stacking state.
    pub ensemble: EnsembleSnapshot,
}

/// Snapshot header for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInfo {
    /// Version.
    pub version: u64,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Why it was taken.
    pub reason: String,
    /// Descriptor count.
    pub descriptors: usize,
}

/// What a restore did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    /// Snapshot version restored.
    pub version: u64,
    /// Descriptors re-installed.
    pub descriptors_restored: usize,
    /// Backend keys the restored traffic needs but the registry lacks.
    pub missing_backends: Vec<String>,
    /// Artifact locations whose bytes no longer match the recorded checksum.
    pub checksum_mismatches: Vec<String>,
    /// Artifact locations that could not be read.
    pub missing_artifacts: Vec<String>,
}

impl RestoreReport {
    /// `true` when nothing needs operator attention.
    pub fn is_clean(&self) -> bool {
        self.missing_backends.is_empty()
            && self.checksum_mismatches.is_empty()
            && self.missing_artifacts.is_empty()
    }
}

#[derive(Debug, Default)]
struct History {
    snapshots: VecDeque<RecoverySnapshot>,
    next_version: u64,
}

// ---------------------------------------------------------------------------
// DisasterRecovery
// ---------------------------------------------------------------------------

/// Snapshot and restore of deployment and ensemble state.
pub struct DisasterRecovery {
    deployment: Arc<DeploymentManager>,
    ensemble: Arc<EnsemblePredictor>,
    artifacts: Arc<ArtifactStore>,
    table: Arc<RoutingTableHandle>,
    settings: RecoverySettings,
    history: Mutex<History>,
}

impl std::fmt::Debug for DisasterRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisasterRecovery")
            .field("settings", &self.settings)
            .finish()
    }
}

impl DisasterRecovery {
    /// Recovery over the shared components.
    pub fn new(
        deployment: Arc<DeploymentManager>,
        ensemble: Arc<EnsemblePredictor>,
        artifacts: Arc<ArtifactStore>,
        table: Arc<RoutingTableHandle>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            deployment,
            ensemble,
            artifacts,
            table,
            settings,
            history: Mutex::new(History::default()),
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    /// Capture the current state, keep it in memory and, with a directory
    /// configured, write it to `snapshot-{version}.json`.
    ///
    /// # Errors
    ///
    /// - [`RecoveryError::LockPoisoned`] if the history lock is poisoned.
    /// - [`RecoveryError::Io`] / [`RecoveryError::Serialization`] if the file
    ///   could not be written; the in-memory copy is kept regardless.
    pub async fn snapshot(&self, reason: &str) -> Result<RecoverySnapshot, RecoveryError> {
        let descriptors = self.deployment.export_descriptors();
        let artifacts = descriptors
            .iter()
            .filter_map(|d| {
                Some(ArtifactRecord {
                    lineage: d.model_id.clone(),
                    version: d.version.clone(),
                    location: d.artifact_location.clone()?,
                    checksum: d.artifact_checksum.clone()?,
                })
            })
            .collect();
        let traffic = self.table.load().lineages().clone();
        let ensemble = self.ensemble.export_state();

        let snapshot = {
            let mut history = self.history.lock().map_err(|_| RecoveryError::LockPoisoned)?;
            let snapshot = RecoverySnapshot {
                version: history.next_version,
                created_at: Utc::now(),
                reason: reason.to_string(),
                descriptors,
                traffic,
                artifacts,
                ensemble,
            };
            history.next_version += 1;
            push_bounded(&mut history, snapshot.clone(), self.settings.max_snapshots);
            snapshot
        };

        if let Some(dir) = &self.settings.dir {
            write_snapshot(dir, &snapshot).await?;
        }
        info!(
            version = snapshot.version,
            descriptors = snapshot.descriptors.len(),
            reason = reason,
            "recovery snapshot taken"
        );
        Ok(snapshot)
    }

    /// Load snapshot files from the configured directory into memory,
    /// oldest first. Returns how many were loaded.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::Io`] if the directory cannot be listed. Unreadable
    /// files are skipped with a warning.
    pub async fn load_persisted(&self) -> Result<usize, RecoveryError> {
        let Some(dir) = &self.settings.dir else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(RecoveryError::Io(e.to_string())),
        };
        let mut loaded = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecoveryError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_snapshot(&path).await {
                Ok(s) => loaded.push(s),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        loaded.sort_by_key(|s| s.version);

        let mut history = self.history.lock().map_err(|_| RecoveryError::LockPoisoned)?;
        let count = loaded.len();
        for snapshot in loaded {
            if history.snapshots.iter().any(|s| s.version == snapshot.version) {
                continue;
            }
            history.next_version = history.next_version.max(snapshot.version + 1);
            push_bounded(&mut history, snapshot, self.settings.max_snapshots);
        }
        history.snapshots.make_contiguous().sort_by_key(|s| s.version);
        Ok(count)
    }

    /// Headers of the snapshots in memory, oldest first.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::LockPoisoned`].
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, RecoveryError> {
        let history = self.history.lock().map_err(|_| RecoveryError::LockPoisoned)?;
        Ok(history
            .snapshots
            .iter()
            .map(|s| SnapshotInfo {
                version: s.version,
                created_at: s.created_at,
                reason: s.reason.clone(),
                descriptors: s.descriptors.len(),
            })
            .collect())
    }

    /// Snapshot `version`, if kept in memory.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::NotFound`] or [`RecoveryError::LockPoisoned`].
    pub fn get(&self, version: u64) -> Result<RecoverySnapshot, RecoveryError> {
        let history = self.history.lock().map_err(|_| RecoveryError::LockPoisoned)?;
        history
            .snapshots
            .iter()
            .find(|s| s.version == version)
            .cloned()
            .ok_or(RecoveryError::NotFound(version))
    }

    /// Restore the newest snapshot.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::Empty`] when nothing was captured or loaded.
    pub async fn restore_latest(&self) -> Result<RestoreReport, RecoveryError> {
        let latest = {
            let history = self.history.lock().map_err(|_| RecoveryError::LockPoisoned)?;
            history.snapshots.back().cloned().ok_or(RecoveryError::Empty)?
        };
        self.apply(latest).await
    }

    /// Restore snapshot `version`.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::NotFound`] if the version is not kept.
    pub async fn restore(&self, version: u64) -> Result<RestoreReport, RecoveryError> {
        let snapshot = self.get(version)?;
        self.apply(snapshot).await
    }

    /// Spawn periodic snapshots; a last one is taken on shutdown.
    pub fn spawn_periodic(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let recovery = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(recovery.settings.interval_secs.max(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "recovery snapshots started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = recovery.snapshot("periodic").await {
                            warn!(error = %e, "periodic snapshot failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            if let Err(e) = recovery.snapshot("shutdown").await {
                                warn!(error = %e, "shutdown snapshot failed");
                            }
                            info!("recovery snapshots stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn apply(&self, snapshot: RecoverySnapshot) -> Result<RestoreReport, RecoveryError> {
        let mut checksum_mismatches = Vec::new();
        let mut missing_artifacts = Vec::new();
        for artifact in &snapshot.artifacts {
            match self.artifacts.current_checksum(&artifact.location).await {
                Ok(sum) if sum == artifact.checksum => {}
                Ok(sum) => {
                    warn!(
                        location = %artifact.location,
                        expected = %artifact.checksum,
                        found = %sum,
                        "artifact checksum mismatch"
                    );
                    checksum_mismatches.push(artifact.location.clone());
                }
                Err(e) => {
                    debug!(location = %artifact.location, error = %e, "artifact unreadable");
                    missing_artifacts.push(artifact.location.clone());
                }
            }
        }

        let descriptors_restored = snapshot.descriptors.len();
        let missing_backends = self.deployment.restore_descriptors(snapshot.descriptors);
        self.ensemble.restore_state(&snapshot.ensemble);

        let report = RestoreReport {
            version: snapshot.version,
            descriptors_restored,
            missing_backends,
            checksum_mismatches,
            missing_artifacts,
        };
        if report.is_clean() {
            info!(version = report.version, "recovery snapshot restored");
        } else {
            warn!(
                version = report.version,
                missing_backends = report.missing_backends.len(),
                checksum_mismatches = report.checksum_mismatches.len(),
                missing_artifacts = report.missing_artifacts.len(),
                "recovery snapshot restored with problems"
            );
        }
        Ok(report)
    }
}

fn push_bounded(history: &mut History, snapshot: RecoverySnapshot, max: usize) {
    history.snapshots.push_back(snapshot);
    while history.snapshots.len() > max.max(1) {
        history.snapshots.pop_front();
    }
}

async fn write_snapshot(dir: &Path, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RecoveryError::Io(e.to_string()))?;
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| RecoveryError::Serialization(e.to_string()))?;
    let path = dir.join(format!("snapshot-{:08}.json", snapshot.version));
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| RecoveryError::Io(e.to_string()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| RecoveryError::Io(e.to_string()))?;
    debug!(path = %path.display(), "snapshot written");
    Ok(())
}

async fn read_snapshot(path: &Path) -> Result<RecoverySnapshot, RecoveryError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RecoveryError::Io(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| RecoveryError::Serialization(e.to_string()))
}
