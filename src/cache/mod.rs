//! # Stage: Multi-Tier Prediction Cache
//!
//! ## Responsibility
//! Hide backend latency behind an ordered stack of cache tiers: an in-process
//! LRU, an optional shared Redis tier and an optional persistent disk tier.
//! Also answers opt-in near-duplicate lookups through per-model fingerprint
//! buckets.
//!
//! ## Guarantees
//! - Expired entries are never returned from any tier
//! - A hit in a slower tier is copied into every faster tier before returning
//! - `set` completes the fastest tier synchronously; slower tiers are written
//!   by spawned best-effort tasks
//! - Any tier error is a miss for that tier only; callers never see cache errors
//! - Near-duplicate scans are bounded by `max_bucket_entries` per bucket
//!
//! ## NOT Responsible For
//! - Deciding what to cache (that belongs to `routing`)
//! - Cross-request write ordering (last write wins per key)
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_prediction_orchestrator::cache::{CacheSettings, MultiTierCache};
//! # #[tokio::main]
//! # async fn main() {
//! let cache = MultiTierCache::memory_only(CacheSettings::default());
//! cache.set("pred:quality:abc", "{\"value\":0.8}", Duration::from_secs(60)).await;
//! assert!(cache.get("pred:quality:abc").await.is_some());
//! # }
//! ```

pub mod disk;
pub mod memory;
#[cfg(feature = "caching")]
pub mod redis;
pub mod similarity;
pub mod tier;

pub use disk::DiskTier;
pub use memory::MemoryTier;
pub use tier::{CacheEntry, CacheError, CacheTier};

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics;

// ── Settings ─────────────────────────────────────────────────────────────

/// Cache configuration (`[cache]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum entries in the in-process tier.
    pub fast_capacity: usize,
    /// TTL applied to routed predictions.
    pub default_ttl_secs: u64,
    /// Optional Redis URL for the shared tier (requires feature `caching`).
    pub redis_url: Option<String>,
    /// Key prefix in Redis.
    pub redis_prefix: String,
    /// Optional directory for the persistent tier.
    pub disk_dir: Option<String>,
    /// Minimum cosine similarity for a near-duplicate hit.
    pub similarity_threshold: f32,
    /// Fingerprint dimensionality.
    pub fingerprint_dim: usize,
    /// Fingerprints retained per bucket (model id).
    pub max_bucket_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            fast_capacity: 10_000,
            default_ttl_secs: 3600,
            redis_url: None,
            redis_prefix: "pred:".to_string(),
            disk_dir: None,
            similarity_threshold: 0.95,
            fingerprint_dim: 128,
            max_bucket_entries: 512,
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
}

/// Counters for one tier.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TierStats {
    /// Tier name.
    pub name: String,
    /// Lookups answered by this tier.
    pub hits: u64,
    /// Lookups this tier could not answer.
    pub misses: u64,
    /// Lookups or writes that failed and were treated as misses.
    pub errors: u64,
    /// Successful writes, promotions included.
    pub writes: u64,
    /// Entry count, when the tier reports one.
    pub entries: Option<usize>,
}

/// Cache-wide statistics for the operational surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    /// Per-tier counters in lookup order.
    pub tiers: Vec<TierStats>,
    /// Total `get` calls.
    pub lookups: u64,
    /// `get` calls answered by any tier.
    pub hits: u64,
    /// `get_similar` calls.
    pub similar_lookups: u64,
    /// Near-duplicate hits.
    pub similar_hits: u64,
    /// `hits / lookups`, 0.0 before the first lookup.
    pub hit_rate: f64,
}

/// A near-duplicate cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarHit {
    /// Key of the matched entry.
    pub key: String,
    /// Cached value.
    pub value: String,
    /// Cosine similarity between the fingerprints.
    pub similarity: f32,
}

struct Fingerprinted {
    key: String,
    fingerprint: Vec<f32>,
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Ordered stack of cache tiers, fastest first.
pub struct MultiTierCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    counters: Arc<Vec<TierCounters>>,
    buckets: DashMap<String, VecDeque<Fingerprinted>>,
    lookups: AtomicU64,
    hits: AtomicU64,
    similar_lookups: AtomicU64,
    similar_hits: AtomicU64,
    settings: CacheSettings,
}

impl MultiTierCache {
    /// Build a cache over explicit tiers (fastest first).
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>, settings: CacheSettings) -> Self {
        let counters = tiers.iter().map(|_| TierCounters::default()).collect();
        Self {
            tiers,
            counters: Arc::new(counters),
            buckets: DashMap::new(),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            similar_lookups: AtomicU64::new(0),
            similar_hits: AtomicU64::new(0),
            settings,
        }
    }

    /// Single in-process tier sized by `settings.fast_capacity`.
    pub fn memory_only(settings: CacheSettings) -> Self {
        let fast: Arc<dyn CacheTier> = Arc::new(MemoryTier::new("memory", settings.fast_capacity));
        Self::new(vec![fast], settings)
    }

    /// Build the configured tier stack.
    ///
    /// Tiers that cannot be opened are skipped with a warning; the cache
    /// always has at least the in-process tier.
    pub async fn from_settings(settings: CacheSettings) -> Self {
        let mut tiers: Vec<Arc<dyn CacheTier>> =
            vec![Arc::new(MemoryTier::new("memory", settings.fast_capacity))];

        if let Some(tier) = redis_tier(&settings).await {
            tiers.push(tier);
        }

        if let Some(dir) = &settings.disk_dir {
            match DiskTier::open("disk", dir).await {
                Ok(tier) => tiers.push(Arc::new(tier)),
                Err(e) => warn!(error = %e, dir = %dir, "disk tier disabled"),
            }
        }

        Self::new(tiers, settings)
    }

    /// Settings this cache was built with.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Default TTL for routed predictions.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.default_ttl_secs)
    }

    /// Tier names in lookup order.
    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    /// Look `key` up tier by tier, promoting a slower-tier hit into every
    /// faster tier.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let value = self.lookup(key).await;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    async fn lookup(&self, key: &str) -> Option<String> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            let counters = &self.counters[idx];
            match tier.get(key).await {
                Ok(Some(entry)) if !entry.is_expired() => {
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_cache_lookup(tier.name(), "hit");
                    debug!(key = key, tier = tier.name(), "cache hit");
                    if idx > 0 {
                        self.promote(idx, &entry).await;
                    }
                    return Some(entry.value);
                }
                Ok(_) => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                    metrics::record_cache_lookup(tier.name(), "miss");
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    metrics::record_cache_lookup(tier.name(), "error");
                    debug!(key = key, tier = tier.name(), error = %e, "cache tier unavailable, treated as miss");
                }
            }
        }
        debug!(key = key, "cache miss");
        None
    }

    async fn promote(&self, found_in: usize, entry: &CacheEntry) {
        for (idx, faster) in self.tiers[..found_in].iter().enumerate() {
            match faster.put(entry.clone()).await {
                Ok(()) => {
                    self.counters[idx].writes.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %entry.key, from = %entry.tier, to = faster.name(), "promoted cache entry");
                }
                Err(e) => {
                    self.counters[idx].errors.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %entry.key, tier = faster.name(), error = %e, "promotion failed");
                }
            }
        }
    }

    /// Write to the fastest tier now and to slower tiers in the background.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let entry = CacheEntry::new(key, value, ttl);
        let Some((fastest, slower)) = self.tiers.split_first() else {
            return;
        };

        match fastest.put(entry.clone()).await {
            Ok(()) => {
                self.counters[0].writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters[0].errors.fetch_add(1, Ordering::Relaxed);
                debug!(key = %entry.key, tier = fastest.name(), error = %e, "cache write failed");
            }
        }

        for (offset, tier) in slower.iter().enumerate() {
            let idx = offset + 1;
            let tier = Arc::clone(tier);
            let counters = Arc::clone(&self.counters);
            let entry = entry.clone();
            tokio::spawn(async move {
                match tier.put(entry).await {
                    Ok(()) => {
                        counters[idx].writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters[idx].errors.fetch_add(1, Ordering::Relaxed);
                        debug!(tier = tier.name(), error = %e, "background cache write failed");
                    }
                }
            });
        }
    }

    /// Write to a single tier only (warm-up and tests).
    ///
    /// Returns `false` if the index is out of range or the write failed.
    pub async fn set_in_tier(
        &self,
        tier: usize,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> bool {
        let Some(target) = self.tiers.get(tier) else {
            return false;
        };
        match target.put(CacheEntry::new(key, value, ttl)).await {
            Ok(()) => {
                self.counters[tier].writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(tier = target.name(), error = %e, "direct tier write failed");
                false
            }
        }
    }

    /// Peek at one tier without promotion or stats.
    pub async fn get_from_tier(&self, tier: usize, key: &str) -> Option<CacheEntry> {
        let target = self.tiers.get(tier)?;
        target.get(key).await.ok().flatten()
    }

    /// Delete `key` from every tier, ignoring tier errors.
    pub async fn remove(&self, key: &str) {
        for tier in &self.tiers {
            if let Err(e) = tier.remove(key).await {
                debug!(key = key, tier = tier.name(), error = %e, "cache delete failed");
            }
        }
        for mut bucket in self.buckets.iter_mut() {
            bucket.value_mut().retain(|f| f.key != key);
        }
    }

    /// Record `text`'s fingerprint under `bucket` so later near-duplicates can
    /// find `key`. The oldest fingerprint is dropped once the bucket is full.
    pub fn index_similar(&self, bucket: &str, text: &str, key: &str) {
        if self.settings.max_bucket_entries == 0 {
            return;
        }
        let fingerprint = similarity::fingerprint(text, self.settings.fingerprint_dim);
        let mut entries = self.buckets.entry(bucket.to_string()).or_default();
        entries.retain(|f| f.key != key);
        entries.push_back(Fingerprinted {
            key: key.to_string(),
            fingerprint,
        });
        while entries.len() > self.settings.max_bucket_entries {
            entries.pop_front();
        }
    }

    /// Best near-duplicate of `text` in `bucket` with similarity ≥ `threshold`
    /// whose entry is still live in some tier.
    ///
    /// Candidates are tried most similar first, so an expired best match
    /// falls through to the next live one. Counted under `similar_lookups`,
    /// not `lookups`.
    pub async fn get_similar(&self, bucket: &str, text: &str, threshold: f32) -> Option<SimilarHit> {
        self.similar_lookups.fetch_add(1, Ordering::Relaxed);
        let query = similarity::fingerprint(text, self.settings.fingerprint_dim);
        let mut candidates: Vec<(f32, String)> = {
            let entries = self.buckets.get(bucket)?;
            entries
                .iter()
                .map(|f| (similarity::cosine_similarity(&query, &f.fingerprint), f.key.clone()))
                .filter(|(sim, _)| *sim >= threshold)
                .collect()
        };
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        for (similarity, key) in candidates {
            if let Some(value) = self.lookup(&key).await {
                self.similar_hits.fetch_add(1, Ordering::Relaxed);
                debug!(bucket = bucket, key = %key, similarity = similarity, "near-duplicate cache hit");
                return Some(SimilarHit {
                    key,
                    value,
                    similarity,
                });
            }
        }
        None
    }

    /// Snapshot of cache counters.
    pub fn stats(&self) -> CacheStats {
        let tiers = self
            .tiers
            .iter()
            .zip(self.counters.iter())
            .map(|(tier, c)| TierStats {
                name: tier.name().to_string(),
                hits: c.hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
                writes: c.writes.load(Ordering::Relaxed),
                entries: tier.len_hint(),
            })
            .collect();
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        CacheStats {
            tiers,
            lookups,
            hits,
            similar_lookups: self.similar_lookups.load(Ordering::Relaxed),
            similar_hits: self.similar_hits.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(feature = "caching")]
async fn redis_tier(settings: &CacheSettings) -> Option<Arc<dyn CacheTier>> {
    let url = settings.redis_url.as_ref()?;
    match redis::RedisTier::connect("redis", url, settings.redis_prefix.clone()).await {
        Ok(tier) => Some(Arc::new(tier)),
        Err(e) => {
            warn!(error = %e, "redis tier disabled");
            None
        }
    }
}

#[cfg(not(feature = "caching"))]
async fn redis_tier(settings: &CacheSettings) -> Option<Arc<dyn CacheTier>> {
    if settings.redis_url.is_some() {
        warn!("redis_url configured but the `caching` feature is disabled");
    }
    None
}

/// Cache key for a model/payload pair.
///
/// Uses SHA-256 over the canonical JSON so keys are stable across processes
/// and shared tiers.
pub fn cache_key(model_id: &str, payload: &serde_json::Value) -> String {
    let digest = Sha256::digest(payload.to_string().as_bytes());
    format!("pred:{model_id}:{}", &hex::encode(digest)[..32])
}
