//! Shared Redis tier (feature `caching`).
//!
//! Entries are stored as JSON under `<prefix><key>` with `SETEX`, so Redis
//! enforces the TTL; the expiry check on read covers clock skew between
//! replicas.

use super::tier::{CacheEntry, CacheError, CacheTier};
use async_trait::async_trait;

/// Redis-backed cache tier.
pub struct RedisTier {
    name: String,
    client: redis::Client,
    prefix: String,
}

impl RedisTier {
    /// Connect and verify the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(
        name: impl Into<String>,
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let name = name.into();
        let client = redis::Client::open(redis_url).map_err(|e| unavailable(&name, e))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable(&name, e))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&name, e))?;
        Ok(Self {
            name,
            client,
            prefix: prefix.into(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable(&self.name, e))
    }
}

fn unavailable(tier: &str, e: redis::RedisError) -> CacheError {
    CacheError::Unavailable {
        tier: tier.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut entry: CacheEntry = serde_json::from_str(&raw)?;
        if entry.is_expired() {
            return Ok(None);
        }
        entry.tier = self.name.clone();
        Ok(Some(entry))
    }

    async fn put(&self, mut entry: CacheEntry) -> Result<(), CacheError> {
        // SETEX rejects 0; round up to one second.
        let ttl_secs = entry.remaining_ttl().as_secs().max(1);
        entry.tier = self.name.clone();
        let raw = serde_json::to_string(&entry)?;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SETEX")
            .arg(self.redis_key(&entry.key))
            .arg(ttl_secs)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        Ok(())
    }
}
