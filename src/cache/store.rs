//! Tiered Cache Store
//!
//! Primary read/write surface. Every write lands in the local tier; the
//! distributed tier, when configured and last seen reachable, gets a
//! best-effort copy and is consulted first on reads.
//!
//! ```text
//!              get                               set
//!               │                                 │
//!   remote up? ─┼─► DistributedBackend     ┌──────┴──────┐
//!               │     │ error: mark down   ▼             ▼
//!               ▼     ▼                 remote (if up)  LocalTier
//!            LocalTier ◄── always a complete mirror ─────┘
//! ```
//!
//! Distributed-tier errors never reach callers. The reachability flag only
//! comes back up through [`TieredStore::probe_backend`], after the keys
//! written or deleted during the outage have been purged remotely.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::backend::{BackendStats, DistributedBackend};
use super::codec::Codec;
use super::entry::CacheEntry;
use super::local::LocalTier;
use super::policy::{CacheContext, TtlPolicyEngine};
use super::stats::{LatencyTracker, StoreMetrics};
use crate::error::{Error, Result};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Concurrent `wrap` misses on one key share a single producer call
    pub single_flight: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            single_flight: true,
        }
    }
}

/// Local tier plus optional distributed tier
pub struct TieredStore {
    local: LocalTier,
    remote: Option<Arc<dyn DistributedBackend>>,
    remote_available: AtomicBool,
    /// Keys changed locally while the distributed tier was skipped
    outage_dirty: DashSet<String>,
    /// A flush skipped the distributed tier
    outage_flush: AtomicBool,
    codec: Arc<Codec>,
    policy: Arc<TtlPolicyEngine>,
    metrics: Arc<StoreMetrics>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    config: StoreConfig,
}

impl TieredStore {
    /// Local-only store
    pub fn new(local: LocalTier, codec: Arc<Codec>, policy: Arc<TtlPolicyEngine>) -> Self {
        Self {
            local,
            remote: None,
            remote_available: AtomicBool::new(false),
            outage_dirty: DashSet::new(),
            outage_flush: AtomicBool::new(false),
            codec,
            policy,
            metrics: Arc::new(StoreMetrics::new()),
            in_flight: DashMap::new(),
            config: StoreConfig::default(),
        }
    }

    /// Attach a distributed tier, assumed reachable until an operation fails
    pub fn with_remote(mut self, remote: Arc<dyn DistributedBackend>) -> Self {
        self.remote = Some(remote);
        self.remote_available = AtomicBool::new(true);
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    // -------------------------------------------------------------------------
    // Data path
    // -------------------------------------------------------------------------

    /// Read a value.
    ///
    /// Returns [`Error::CorruptEntry`] when the stored bytes cannot be decoded;
    /// every other tier problem reads as a miss or falls through to local.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let tracker = LatencyTracker::start();

        if let Some(entry) = self.remote_entry(key).await? {
            let value = self.decode(key, &entry)?;
            self.metrics.record_remote_hit();
            self.metrics.record_read_latency(tracker.elapsed());
            debug!(key, "Cache hit (distributed)");
            return Ok(Some(value));
        }

        if let Some(entry) = self.local.get(key) {
            let value = self.decode(key, &entry)?;
            self.metrics.record_local_hit();
            self.metrics.record_read_latency(tracker.elapsed());
            debug!(key, "Cache hit (local)");
            return Ok(Some(value));
        }

        self.metrics.record_miss();
        debug!(key, "Cache miss");
        Ok(None)
    }

    /// Write a value with an explicit TTL.
    ///
    /// Only serialization can fail.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let tracker = LatencyTracker::start();
        let entry = self.codec.compress(value)?;

        match self.live_remote() {
            Some(remote) => {
                if let Err(e) = remote.set(key, entry.to_bytes(), remote_ttl_secs(ttl)).await {
                    self.mark_remote_down("set", &e);
                    self.record_missed(key);
                }
            }
            None => self.record_missed(key),
        }

        if !self.local.insert(key.to_string(), entry, ttl) {
            warn!(key, "Entry too large for local tier, not mirrored");
        }

        self.metrics.record_set();
        self.metrics.record_write_latency(tracker.elapsed());
        debug!(key, ttl_secs = ttl.as_secs(), "Cache set");
        Ok(())
    }

    /// Delete from both tiers. Returns whether either tier held the key.
    pub async fn del(&self, key: &str) -> bool {
        let mut removed = false;
        match self.live_remote() {
            Some(remote) => match remote.del(key).await {
                Ok(existed) => removed |= existed,
                Err(e) => {
                    self.mark_remote_down("del", &e);
                    self.record_missed(key);
                }
            },
            None => self.record_missed(key),
        }
        removed |= self.local.remove(key);

        if removed {
            self.metrics.record_delete();
        }
        removed
    }

    /// Drop everything from both tiers
    #[instrument(skip(self))]
    pub async fn flush(&self) {
        match self.live_remote() {
            Some(remote) => {
                if let Err(e) = remote.flush_all().await {
                    self.mark_remote_down("flush", &e);
                    self.outage_flush.store(true, Ordering::Release);
                }
            }
            None if self.remote.is_some() => self.outage_flush.store(true, Ordering::Release),
            None => {}
        }
        self.local.clear();
        info!("Cache flushed");
    }

    /// Whether the local mirror holds a live entry for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.local.contains(key)
    }

    /// Return the cached value, or run `producer`, cache its result for `ttl`
    /// and return it.
    ///
    /// Producer errors come back unchanged and nothing is cached. With
    /// single-flight on, concurrent misses on one key wait for the first
    /// producer instead of running their own.
    pub async fn wrap<T, E, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        if !self.config.single_flight {
            return self.produce(key, ttl, producer).await;
        }

        let flight = InFlight {
            map: &self.in_flight,
            key,
            lock: self
                .in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };

        let _held = flight.lock.lock().await;
        // Another caller may have filled it while we waited
        match self.get(key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => self.produce(key, ttl, producer).await,
            Err(e) => Err(E::from(e)),
        }
    }

    /// [`Self::wrap`] with the TTL chosen by the policy engine
    pub async fn smart_wrap<T, E, F, Fut>(
        &self,
        key: &str,
        category: &str,
        context: Option<CacheContext>,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let context = context.unwrap_or_else(|| CacheContext::new(category));
        let ttl = self.policy.optimal_ttl(&context);
        self.wrap(key, ttl, producer).await
    }

    /// [`Self::set`] with the TTL chosen by the policy engine; returns that TTL
    pub async fn smart_set<T: Serialize + ?Sized>(&self, key: &str, value: &T, category: &str) -> Result<Duration> {
        let ttl = self.policy.contextual_ttl(category);
        self.set(key, value, ttl).await?;
        Ok(ttl)
    }

    async fn produce<T, E, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> std::result::Result<T, E>
    where
        T: Serialize,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let value = producer().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    // -------------------------------------------------------------------------
    // Distributed tier
    // -------------------------------------------------------------------------

    /// Ping the distributed tier and update the reachability flag.
    ///
    /// A recovering tier is reconciled first: changes it missed are purged
    /// so reads fall through to the local mirror. Returns false when no
    /// distributed tier is configured or it is still unusable.
    pub async fn probe_backend(&self) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };

        if let Err(e) = remote.ping().await {
            self.mark_remote_down("ping", &e);
            return false;
        }
        if self.remote_available.load(Ordering::Relaxed) {
            return true;
        }

        match self.reconcile(remote).await {
            Ok(purged) => {
                self.remote_available.store(true, Ordering::Relaxed);
                info!(purged, "Distributed tier reachable again");
            }
            Err(e) => {
                self.mark_remote_down("reconcile", &e);
                return false;
            }
        }

        // Keys changed between the pass above and the flag going up
        if let Err(e) = self.reconcile(remote).await {
            self.mark_remote_down("reconcile", &e);
            return false;
        }
        true
    }

    /// Keys changed during an outage, awaiting reconciliation
    pub fn pending_reconcile(&self) -> usize {
        self.outage_dirty.len()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Last observed reachability (false when not configured)
    pub fn is_remote_available(&self) -> bool {
        self.remote.is_some() && self.remote_available.load(Ordering::Relaxed)
    }

    pub fn remote_stats(&self) -> Option<BackendStats> {
        self.remote.as_ref().map(|r| r.stats())
    }

    fn live_remote(&self) -> Option<&Arc<dyn DistributedBackend>> {
        self.remote
            .as_ref()
            .filter(|_| self.remote_available.load(Ordering::Relaxed))
    }

    async fn remote_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(remote) = self.live_remote() else {
            return Ok(None);
        };

        match remote.get(key).await {
            Ok(Some(bytes)) => CacheEntry::from_bytes(key, bytes).map(Some).map_err(|e| {
                self.metrics.record_corrupt_read();
                e
            }),
            Ok(None) => Ok(None),
            Err(e) => {
                self.mark_remote_down("get", &e);
                Ok(None)
            }
        }
    }

    fn record_missed(&self, key: &str) {
        if self.remote.is_some() {
            self.outage_dirty.insert(key.to_string());
        }
    }

    /// Purge what the distributed tier missed while it was skipped
    async fn reconcile(&self, remote: &Arc<dyn DistributedBackend>) -> Result<usize> {
        if self.outage_flush.load(Ordering::Acquire) {
            remote.flush_all().await?;
            self.outage_flush.store(false, Ordering::Release);
            let purged = self.outage_dirty.len();
            self.outage_dirty.clear();
            return Ok(purged);
        }

        let keys: Vec<String> = self.outage_dirty.iter().map(|k| k.key().clone()).collect();
        for key in &keys {
            remote.del(key).await?;
            self.outage_dirty.remove(key);
        }
        Ok(keys.len())
    }

    fn mark_remote_down(&self, op: &str, error: &Error) {
        self.metrics.record_remote_error();
        if self.remote_available.swap(false, Ordering::Relaxed) {
            warn!(op, error = %error, "Distributed tier unreachable, falling back to local tier");
        } else {
            debug!(op, error = %error, "Distributed tier still unreachable");
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, entry: &CacheEntry) -> Result<T> {
        self.codec.decode(key, entry).map_err(|e| {
            self.metrics.record_corrupt_read();
            warn!(key, error = %e, "Corrupt cache entry");
            e
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Live keys in the local mirror
    pub fn local_keys(&self) -> Vec<String> {
        self.local.keys()
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn policy(&self) -> &Arc<TtlPolicyEngine> {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }
}

/// Removes a key's in-flight lock once its last holder leaves, including
/// when the holding future is dropped mid-flight
struct InFlight<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // The map and this guard hold two references; more means waiters remain
        self.map.remove_if(self.key, |_, l| {
            Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) <= 2
        });
    }
}

/// Whole seconds for the distributed tier, rounded up, at least 1
fn remote_ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::InMemoryBackend;
    use crate::cache::codec::CodecConfig;
    use crate::cache::policy::PolicyConfig;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    const HOUR: Duration = Duration::from_secs(3600);

    fn local_store() -> TieredStore {
        TieredStore::new(
            LocalTier::new(),
            Arc::new(Codec::new(CodecConfig::default())),
            Arc::new(TtlPolicyEngine::new(PolicyConfig::default())),
        )
    }

    fn remote_store() -> (TieredStore, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        (local_store().with_remote(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let store = local_store();
        store.set("league:1", &json!({"name": "Dynasty"}), HOUR).await.unwrap();

        let value: Option<Value> = store.get("league:1").await.unwrap();
        assert_eq!(value, Some(json!({"name": "Dynasty"})));

        assert!(store.del("league:1").await);
        assert!(store.get::<Value>("league:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_reach_both_tiers() {
        let (store, backend) = remote_store();
        store.set("roster:1", &vec![1, 2, 3], HOUR).await.unwrap();

        assert!(backend.contains("roster:1"));
        assert!(store.local().contains("roster:1"));
        assert_eq!(store.metrics().snapshot().sets, 1);

        let value: Vec<i32> = store.get("roster:1").await.unwrap().unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(store.metrics().snapshot().remote_hits, 1);
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_local() {
        let (store, backend) = remote_store();
        store.set("state:nfl", &json!({"week": 3}), HOUR).await.unwrap();

        backend.set_available(false);
        let value: Option<Value> = store.get("state:nfl").await.unwrap();
        assert_eq!(value, Some(json!({"week": 3})));
        assert!(!store.is_remote_available());

        // Writes keep working while down and skip the remote tier
        store.set("state:nfl", &json!({"week": 4}), HOUR).await.unwrap();
        let value: Option<Value> = store.get("state:nfl").await.unwrap();
        assert_eq!(value, Some(json!({"week": 4})));
        assert_eq!(backend.stats().failures, 1);

        backend.set_available(true);
        assert!(store.probe_backend().await);
        assert!(store.is_remote_available());
    }

    #[tokio::test]
    async fn test_recovery_purges_changes_missed_during_outage() {
        let (store, backend) = remote_store();
        store.set("state:nfl", &json!({"week": 3}), HOUR).await.unwrap();
        store.set("roster:1", &json!([1]), HOUR).await.unwrap();

        backend.set_available(false);
        store.set("state:nfl", &json!({"week": 4}), HOUR).await.unwrap();
        store.del("roster:1").await;
        assert!(!store.is_remote_available());
        assert_eq!(store.pending_reconcile(), 2);

        backend.set_available(true);
        assert!(store.probe_backend().await);
        assert_eq!(store.pending_reconcile(), 0);
        assert!(!backend.contains("state:nfl"));
        assert!(!backend.contains("roster:1"));

        let state: Option<Value> = store.get("state:nfl").await.unwrap();
        assert_eq!(state, Some(json!({"week": 4})));
        let roster: Option<Value> = store.get("roster:1").await.unwrap();
        assert_eq!(roster, None);
    }

    #[tokio::test]
    async fn test_recovery_replays_missed_flush() {
        let (store, backend) = remote_store();
        store.set("players:nfl", &json!(["a"]), HOUR).await.unwrap();

        backend.set_available(false);
        store.del("roster:1").await;
        store.flush().await;

        backend.set_available(true);
        assert!(store.probe_backend().await);
        assert!(!backend.contains("players:nfl"));
        assert_eq!(store.pending_reconcile(), 0);
        let players: Option<Value> = store.get("players:nfl").await.unwrap();
        assert_eq!(players, None);
    }

    #[tokio::test]
    async fn test_unreachable_tier_keeps_pending_changes() {
        let (store, backend) = remote_store();
        store.set("state:nfl", &json!({"week": 3}), HOUR).await.unwrap();

        backend.set_available(false);
        store.set("state:nfl", &json!({"week": 4}), HOUR).await.unwrap();
        assert!(!store.probe_backend().await);
        assert!(!store.is_remote_available());
        assert_eq!(store.pending_reconcile(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_remote_entry_surfaces() {
        let (store, backend) = remote_store();
        backend
            .set("matchup:1:2", bytes::Bytes::from_static(b"garbage"), 60)
            .await
            .unwrap();

        let err = store.get::<Value>("matchup:1:2").await.unwrap_err();
        assert_matches::assert_matches!(err, Error::CorruptEntry { .. });
        assert_eq!(store.metrics().snapshot().corrupt_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wrap_releases_in_flight_entry() {
        let store = local_store();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            store.wrap("players:nfl", HOUR, || {
                std::future::pending::<std::result::Result<Value, Error>>()
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(store.in_flight.is_empty());

        let value: Value = store
            .wrap("players:nfl", HOUR, || async { Ok::<_, Error>(json!(["a"])) })
            .await
            .unwrap();
        assert_eq!(value, json!(["a"]));
        assert!(store.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_wrap_hit_skips_producer() {
        let store = local_store();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Value = store
                .wrap("players:nfl", HOUR, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(json!({"count": 1}))
                })
                .await
                .unwrap();
            assert_eq!(value, json!({"count": 1}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrap_producer_error_not_cached() {
        let store = local_store();

        let result: std::result::Result<Value, anyhow::Error> = store
            .wrap("trending:nfl:add", HOUR, || async {
                Err(anyhow::anyhow!("rate limited"))
            })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "rate limited");
        assert!(!store.contains("trending:nfl:add"));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let store = Arc::new(local_store());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                store
                    .wrap("players:nfl", HOUR, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, Error>(json!(["p1", "p2"]))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let value: Value = handle.await.unwrap();
            assert_eq!(value, json!(["p1", "p2"]));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_smart_set_uses_policy_ttl() {
        let store = local_store();
        let ttl = store
            .smart_set("users:1", &json!([{"user_id": "u1"}]), "user")
            .await
            .unwrap();
        assert!(ttl >= Duration::from_secs(30));
        assert!(store.local().ttl_remaining("users:1").unwrap() <= ttl);
    }

    #[test]
    fn test_remote_ttl_rounding() {
        assert_eq!(remote_ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(remote_ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(remote_ttl_secs(Duration::ZERO), 1);
    }
}
