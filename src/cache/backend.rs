//! Distributed Tier - Shared Backing Store
//!
//! Optional tier shared between replicas. The store treats every call here
//! as fallible I/O: errors demote the tier and are never shown to callers.
//!
//! # Design
//!
//! - Async trait so network-backed stores never block the runtime
//! - Opaque byte values; the store owns the envelope format
//! - In-memory implementation with an availability switch for tests

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Distributed backing store
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Put a value that expires after `ttl_seconds`
    async fn set(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()>;

    /// Delete a value
    async fn del(&self, key: &str) -> Result<bool>;

    /// Drop every value
    async fn flush_all(&self) -> Result<()>;

    /// Reachability probe
    async fn ping(&self) -> Result<()>;

    /// Operation statistics
    fn stats(&self) -> BackendStats;
}

/// Backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Values currently stored
    pub object_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
    /// Operations refused while unavailable
    pub failures: u64,
}

/// In-memory backend for tests and single-node runs
pub struct InMemoryBackend {
    storage: DashMap<String, (Bytes, Instant)>,
    available: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Whether a live value exists, bypassing availability
    pub fn contains(&self, key: &str) -> bool {
        self.storage
            .get(key)
            .map(|v| v.1 > Instant::now())
            .unwrap_or(false)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            Err(Error::Backend("connection refused".into()))
        }
    }
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let expired = match self.storage.get(key) {
            Some(v) if v.1 > now => return Ok(Some(v.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.storage.remove_if(key, |_, v| v.1 <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
        self.storage.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn flush_all(&self) -> Result<()> {
        self.check_available()?;
        self.storage.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            object_count: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
