//! In-process LRU tier.
//!
//! Bounded by entry count; when full, the least recently accessed entry is
//! evicted. Expired entries are dropped lazily on lookup.

use super::tier::{CacheEntry, CacheError, CacheTier};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

/// Fast in-memory cache tier.
pub struct MemoryTier {
    name: String,
    store: DashMap<String, Slot>,
    max_entries: usize,
    clock: AtomicU64,
    available: AtomicBool,
}

impl MemoryTier {
    /// Tier holding at most `max_entries` entries (0 = unbounded).
    pub fn new(name: impl Into<String>, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            store: DashMap::new(),
            max_entries,
            clock: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call returns
    /// [`CacheError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current entry count, expired entries included until touched.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                tier: self.name.clone(),
                reason: "tier marked unavailable".to_string(),
            })
        }
    }

    fn evict_lru(&self) {
        // Collect the victim first so no read guard is held across `remove`.
        let victim = self
            .store
            .iter()
            .min_by_key(|slot| slot.value().last_access)
            .map(|slot| slot.key().clone());
        if let Some(key) = victim {
            self.store.remove(&key);
            debug!(tier = %self.name, key = %key, "evicted least recently used entry");
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.check()?;
        let now = self.tick();
        let mut expired = false;
        let found = match self.store.get_mut(key) {
            Some(mut slot) => {
                if slot.entry.is_expired() {
                    expired = true;
                    None
                } else {
                    slot.last_access = now;
                    slot.entry.hit_count += 1;
                    Some(slot.entry.clone())
                }
            }
            None => None,
        };
        if expired {
            self.store.remove(key);
            debug!(tier = %self.name, key = key, "cache expired");
        }
        Ok(found)
    }

    async fn put(&self, mut entry: CacheEntry) -> Result<(), CacheError> {
        self.check()?;
        if self.max_entries > 0
            && !self.store.contains_key(&entry.key)
            && self.store.len() >= self.max_entries
        {
            self.evict_lru();
        }
        entry.tier = self.name.clone();
        entry.hit_count = 0;
        let last_access = self.tick();
        self.store
            .insert(entry.key.clone(), Slot { entry, last_access });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.store.remove(key);
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.store.len())
    }
}
