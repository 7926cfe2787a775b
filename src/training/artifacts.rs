//! Artifact storage with SHA-256 checksums.
//!
//! Artifacts are JSON documents. With a directory configured they are written
//! to `{dir}/{lineage}/{version}.json` (tmp file + rename) and addressed as
//! `file://…`; otherwise they live in memory as `memory://{lineage}/{version}`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::trainer::ModelArtifact;
use super::TrainingError;

/// Where an artifact lives and what it hashed to when written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// `file://` or `memory://` location.
    pub location: String,
    /// Hex SHA-256 of the stored bytes.
    pub checksum: String,
}

/// Hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// File- or memory-backed artifact store.
pub struct ArtifactStore {
    dir: Option<PathBuf>,
    memory: DashMap<String, Vec<u8>>,
}

impl ArtifactStore {
    /// In-memory store.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            memory: DashMap::new(),
        }
    }

    /// Store rooted at `dir` (created lazily).
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            memory: DashMap::new(),
        }
    }

    /// Persist `artifact` for `lineage`/`version`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Artifact`] on encoding or I/O failure.
    pub async fn put(
        &self,
        lineage: &str,
        version: &str,
        artifact: &ModelArtifact,
    ) -> Result<ArtifactRef, TrainingError> {
        let bytes = serde_json::to_vec_pretty(artifact)
            .map_err(|e| TrainingError::Artifact(e.to_string()))?;
        let sum = checksum(&bytes);
        let location = match &self.dir {
            Some(dir) => {
                let folder = dir.join(sanitize(lineage));
                tokio::fs::create_dir_all(&folder)
                    .await
                    .map_err(|e| TrainingError::Artifact(format!("{}: {e}", folder.display())))?;
                let path = folder.join(format!("{}.json", sanitize(version)));
                let tmp = path.with_extension("json.tmp");
                tokio::fs::write(&tmp, &bytes)
                    .await
                    .map_err(|e| TrainingError::Artifact(format!("{}: {e}", tmp.display())))?;
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| TrainingError::Artifact(format!("{}: {e}", path.display())))?;
                format!("file://{}", path.display())
            }
            None => {
                let location = format!("memory://{lineage}/{version}");
                self.memory.insert(location.clone(), bytes);
                location
            }
        };
        debug!(location = %location, checksum = %sum, "artifact stored");
        Ok(ArtifactRef {
            location,
            checksum: sum,
        })
    }

    /// Raw bytes at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Artifact`] if the location is unknown or unreadable.
    pub async fn bytes(&self, location: &str) -> Result<Vec<u8>, TrainingError> {
        if let Some(path) = location.strip_prefix("file://") {
            return tokio::fs::read(Path::new(path))
                .await
                .map_err(|e| TrainingError::Artifact(format!("{path}: {e}")));
        }
        self.memory
            .get(location)
            .map(|b| b.value().clone())
            .ok_or_else(|| TrainingError::Artifact(format!("no artifact at {location}")))
    }

    /// Decode the artifact at `location`.
    ///
    /// # Errors
    ///
    /// As [`Self::bytes`], plus decode failures.
    pub async fn load(&self, location: &str) -> Result<ModelArtifact, TrainingError> {
        let bytes = self.bytes(location).await?;
        serde_json::from_slice(&bytes).map_err(|e| TrainingError::Artifact(e.to_string()))
    }

    /// Current checksum of the bytes at `location`.
    ///
    /// # Errors
    ///
    /// As [`Self::bytes`].
    pub async fn current_checksum(&self, location: &str) -> Result<String, TrainingError> {
        Ok(checksum(&self.bytes(location).await?))
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            kind: "linear-calibration".into(),
            lineage: "alpha".into(),
            params: json!({"slope": 1.0, "intercept": 0.1}),
            trained_on: 40,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_roundtrip_and_checksum() {
        let store = ArtifactStore::in_memory();
        let r = store.put("alpha", "v2", &artifact()).await.unwrap();
        assert_eq!(r.location, "memory://alpha/v2");
        assert_eq!(store.current_checksum(&r.location).await.unwrap(), r.checksum);
        let loaded = store.load(&r.location).await.unwrap();
        assert_eq!(loaded.trained_on, 40);
        assert_eq!(loaded.params, json!({"slope": 1.0, "intercept": 0.1}));
    }

    #[tokio::test]
    async fn test_file_store_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::in_dir(dir.path());
        let r = store.put("alpha", "v2", &artifact()).await.unwrap();
        assert!(r.location.starts_with("file://"));

        let path = r.location.trim_start_matches("file://").to_string();
        tokio::fs::write(&path, b"{}").await.unwrap();
        assert_ne!(store.current_checksum(&r.location).await.unwrap(), r.checksum);
    }

    #[tokio::test]
    async fn test_unknown_location_errors() {
        let store = ArtifactStore::in_memory();
        assert!(store.bytes("memory://nope/v1").await.is_err());
    }
}
