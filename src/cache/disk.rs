//! Persistent cold tier: one JSON file per entry.
//!
//! File names are the SHA-256 of the key so arbitrary keys map to safe paths.
//! Writes go to a temporary file and are renamed into place, so a reader
//! never observes a partially written entry.

use super::tier::{CacheEntry, CacheError, CacheTier};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory-backed cache tier.
pub struct DiskTier {
    name: String,
    dir: PathBuf,
}

impl DiskTier {
    /// Open (creating if needed) a tier rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created.
    pub async fn open(name: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            name: name.into(),
            dir,
        })
    }

    /// Root directory of this tier.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }
}

#[async_trait]
impl CacheTier for DiskTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if entry.key != key {
            return Ok(None);
        }
        if entry.is_expired() {
            let _ = tokio::fs::remove_file(&path).await;
            debug!(tier = %self.name, key = key, "cache expired");
            return Ok(None);
        }
        entry.tier = self.name.clone();
        Ok(Some(entry))
    }

    async fn put(&self, mut entry: CacheEntry) -> Result<(), CacheError> {
        entry.tier = self.name.clone();
        let path = self.path_for(&entry.key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec(&entry)?;
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disk_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open("disk", dir.path()).await.unwrap();
        tier.put(CacheEntry::new("pred:a", "{\"v\":1}", Duration::from_secs(60)))
            .await
            .unwrap();
        let got = tier.get("pred:a").await.unwrap().unwrap();
        assert_eq!(got.value, "{\"v\":1}");
        assert_eq!(got.tier, "disk");
        tier.remove("pred:a").await.unwrap();
        assert!(tier.get("pred:a").await.unwrap().is_none());
        // Removing twice is fine.
        tier.remove("pred:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_disk_expired_entry_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open("disk", dir.path()).await.unwrap();
        tier.put(CacheEntry::new("k", "v", Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tier.get("k").await.unwrap().is_none());
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_disk_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open("disk", dir.path()).await.unwrap();
        std::fs::write(tier.path_for("k"), b"not json").unwrap();
        assert!(matches!(
            tier.get("k").await,
            Err(CacheError::Serialization(_))
        ));
    }
}
