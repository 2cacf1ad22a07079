//! Local Tier - In-Process Cache
//!
//! Always-present tier that mirrors every write made through the store, so
//! reads keep working when the distributed tier is down or absent.
//!
//! # Design
//!
//! - DashMap for sharded concurrent access
//! - Per-entry expiry checked lazily on read and swept by `cleanup_expired`
//! - Byte-capacity limit: expired entries go first, then oldest-inserted,
//!   only when a write would not otherwise fit

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::entry::CacheEntry;

/// Local tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTierConfig {
    /// Maximum bytes held (keys plus payloads)
    pub max_bytes: u64,
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024, // 100 MB
            max_entries: 100_000,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    /// Insertion order, for oldest-first eviction
    seq: u64,
    expires_at: Instant,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

fn slot_size(key: &str, entry: &CacheEntry) -> u64 {
    (key.len() + entry.size()) as u64
}

/// In-process tier
pub struct LocalTier {
    storage: DashMap<String, Slot>,
    config: LocalTierConfig,
    current_size: AtomicU64,
    next_seq: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::with_config(LocalTierConfig::default())
    }

    pub fn with_config(config: LocalTierConfig) -> Self {
        Self {
            storage: DashMap::new(),
            config,
            current_size: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get a live entry, dropping it if it has expired
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let expired = match self.storage.get(key) {
            Some(slot) if !slot.is_expired(now) => return Some(slot.entry.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.remove_if_expired(key, now);
        }
        None
    }

    /// Insert an entry that lives for `ttl`. Returns false if it can never fit.
    pub fn insert(&self, key: String, entry: CacheEntry, ttl: Duration) -> bool {
        let size = slot_size(&key, &entry);
        if size > self.config.max_bytes {
            debug!(key = %key, size, "Entry larger than local tier capacity");
            return false;
        }

        // Replacing an entry frees its bytes first
        let replaced = self
            .storage
            .get(&key)
            .map(|slot| slot_size(&key, &slot.entry))
            .unwrap_or(0);
        let projected = self.size_bytes().saturating_sub(replaced) + size;
        let is_new = replaced == 0 && !self.storage.contains_key(&key);
        if projected > self.config.max_bytes
            || (is_new && self.storage.len() >= self.config.max_entries)
        {
            self.make_room(size);
        }

        let slot = Slot {
            entry,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            expires_at: Instant::now() + ttl,
        };

        if let Some(old) = self.storage.insert(key.clone(), slot) {
            self.current_size
                .fetch_sub(slot_size(&key, &old.entry), Ordering::Relaxed);
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> bool {
        match self.storage.remove(key) {
            Some((k, slot)) => {
                self.current_size
                    .fetch_sub(slot_size(&k, &slot.entry), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Whether a live entry exists
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.storage
            .get(key)
            .map(|slot| !slot.is_expired(now))
            .unwrap_or(false)
    }

    /// Keys of all live entries
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.storage
            .iter()
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Remaining lifetime of a live entry
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.storage
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.expires_at - now)
    }

    /// Drop everything
    pub fn clear(&self) {
        self.storage.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    /// Sweep expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .storage
            .iter()
            .filter(|slot| slot.is_expired(now))
            .map(|slot| slot.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| self.remove_if_expired(key, now))
            .count()
    }

    /// Evict oldest-inserted entries until usage is at or below `ratio` of capacity
    pub fn evict_to_ratio(&self, ratio: f64) -> usize {
        let target = (self.config.max_bytes as f64 * ratio.clamp(0.0, 1.0)) as u64;
        self.evict_oldest_until(|tier| tier.size_bytes() <= target)
    }

    fn make_room(&self, incoming: u64) {
        self.cleanup_expired();
        let limit = self.config.max_bytes.saturating_sub(incoming);
        let max_entries = self.config.max_entries.saturating_sub(1);
        self.evict_oldest_until(|tier| tier.size_bytes() <= limit && tier.len() <= max_entries);
    }

    fn evict_oldest_until(&self, done: impl Fn(&Self) -> bool) -> usize {
        if done(self) {
            return 0;
        }

        let mut candidates: Vec<(String, u64)> = self
            .storage
            .iter()
            .map(|slot| (slot.key().clone(), slot.seq))
            .collect();
        candidates.sort_by_key(|(_, seq)| *seq);

        let mut evicted = 0;
        for (key, _) in candidates {
            if done(self) {
                break;
            }
            if self.remove(&key) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Evicted entries from local tier");
        }
        evicted
    }

    fn remove_if_expired(&self, key: &str, now: Instant) -> bool {
        match self.storage.remove_if(key, |_, slot| slot.is_expired(now)) {
            Some((k, slot)) => {
                self.current_size
                    .fetch_sub(slot_size(&k, &slot.entry), Ordering::Relaxed);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Number of entries, including not yet swept expired ones
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Bytes currently held
    pub fn size_bytes(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Byte capacity
    pub fn capacity(&self) -> u64 {
        self.config.max_bytes
    }

    /// Used / capacity, in 0.0..=1.0
    pub fn memory_pressure(&self) -> f64 {
        if self.config.max_bytes == 0 {
            return 0.0;
        }
        (self.size_bytes() as f64 / self.config.max_bytes as f64).min(1.0)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &LocalTierConfig {
        &self.config
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
