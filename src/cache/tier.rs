//! The storage contract every cache tier implements.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors a tier may report. The multi-tier cache turns every one of these
/// into a miss for that tier; none reach the serving path.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The tier's backing store is down or refused the operation.
    #[error("cache tier '{tier}' unavailable: {reason}")]
    Unavailable {
        /// Tier name.
        tier: String,
        /// Failure description.
        reason: String,
    },

    /// A stored entry could not be encoded or decoded.
    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File-system error in the persistent tier.
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One cached prediction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Serialized prediction.
    pub value: String,
    /// Name of the tier the entry was read from or written to.
    pub tier: String,
    /// When the value was first produced.
    pub created_at: DateTime<Utc>,
    /// After this instant the entry must never be returned.
    pub expires_at: DateTime<Utc>,
    /// Lookups served by this entry in its current tier.
    pub hit_count: u64,
}

impl CacheEntry {
    /// New entry expiring `ttl` from now.
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(3650));
        Self {
            key: key.into(),
            value: value.into(),
            tier: String::new(),
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
        }
    }

    /// Whether the entry has passed its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A single cache tier.
///
/// Tiers report their own failures; they never need to be infallible.
/// Implementations must not return expired entries.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Stable name used in logs, metrics and [`CacheEntry::tier`].
    fn name(&self) -> &str;

    /// Fetch a live entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry, replacing any previous value for its key.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Delete an entry if present.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Number of stored entries, if the tier can tell cheaply.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_and_remaining_ttl() {
        let entry = CacheEntry::new("k", "v", Duration::from_secs(60));
        assert!(!entry.is_expired());
        assert!(entry.remaining_ttl() > Duration::from_secs(58));

        let expired = CacheEntry::new("k", "v", Duration::ZERO);
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_ttl(), Duration::ZERO);
    }
}
