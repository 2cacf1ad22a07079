//! Cache Manager - Orchestration and Remediation
//!
//! Owns the background maintenance tasks and aggregates the store, warmer
//! and invalidation engine into health and performance snapshots. Every
//! scheduled job is also callable directly.
//!
//! ```text
//!                    ┌────────────────────┐
//!                    │    CacheManager    │
//!                    └─────────┬──────────┘
//!        ┌──────────────┬──────┴───────┬───────────────┐
//!        ▼              ▼              ▼               ▼
//!  phase refresh   invalidation     warming      health refresh
//!   (5 min)        check (5 min)   (30m / 2h)       (60 s)
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::invalidation::{InvalidationEngine, TriggerOutcome, TRIGGER_OPTIMIZATION};
use super::keys;
use super::scheduler::{PeriodicTask, TaskSpec};
use super::stats::StoreMetricsSnapshot;
use super::store::TieredStore;
use super::warmer::{CacheWarmer, CycleReport};
use crate::config::duration_secs;
use crate::error::Result;
use crate::monitoring::{
    assess, CacheExporter, ExporterSample, HealthReport, HealthSignals, HealthThresholds,
};

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    #[serde(with = "duration_secs")]
    pub health_refresh_interval: Duration,
    #[serde(with = "duration_secs")]
    pub health_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub phase_refresh_timeout: Duration,
    /// Delay before the first warming cycle after start
    #[serde(with = "duration_secs")]
    pub initial_warm_delay: Duration,
    #[serde(with = "duration_secs")]
    pub warmer_stale_after: Duration,
    #[serde(with = "duration_secs")]
    pub invalidator_stale_after: Duration,
    pub memory_warning: f64,
    pub memory_critical: f64,
    /// `optimize` frees memory above this pressure
    pub optimize_memory_threshold: f64,
    /// ... down to this pressure
    pub optimize_target_ratio: f64,
    /// `optimize` re-warms below this hit rate
    pub low_hit_rate: f64,
    /// `optimize` re-enables compression above this pressure
    pub compression_pressure: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_refresh_interval: Duration::from_secs(60),
            health_timeout: Duration::from_secs(5),
            phase_refresh_timeout: Duration::from_secs(10),
            initial_warm_delay: Duration::from_secs(1),
            warmer_stale_after: Duration::from_secs(3 * 3600),
            invalidator_stale_after: Duration::from_secs(15 * 60),
            memory_warning: 0.7,
            memory_critical: 0.9,
            optimize_memory_threshold: 0.8,
            optimize_target_ratio: 0.7,
            low_hit_rate: 0.5,
            compression_pressure: 0.5,
        }
    }
}

impl ManagerConfig {
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            memory_warning: self.memory_warning,
            memory_critical: self.memory_critical,
            warmer_stale_after: self.warmer_stale_after,
            invalidator_stale_after: self.invalidator_stale_after,
        }
    }
}

/// Local tier memory usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub percentage: f64,
}

/// Metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub compression_ratio: f64,
    pub memory_usage: MemoryUsage,
    /// Live keys per first-two-segment prefix
    pub key_distribution: BTreeMap<String, usize>,
    pub entries: usize,
    pub store: StoreMetricsSnapshot,
}

/// Result of [`CacheManager::optimize`]
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub before: PerformanceMetrics,
    pub after: PerformanceMetrics,
    pub actions: Vec<String>,
}

pub struct CacheManager {
    store: Arc<TieredStore>,
    invalidation: Arc<InvalidationEngine>,
    warmer: Arc<CacheWarmer>,
    exporter: Option<Arc<CacheExporter>>,
    config: ManagerConfig,
    started_at: RwLock<DateTime<Utc>>,
    tasks: Mutex<Vec<PeriodicTask>>,
    last_health: RwLock<Option<HealthReport>>,
}

impl CacheManager {
    pub fn new(
        store: Arc<TieredStore>,
        invalidation: Arc<InvalidationEngine>,
        warmer: Arc<CacheWarmer>,
        config: ManagerConfig,
    ) -> Self {
        let started_at = store.policy().clock().now();
        Self {
            store,
            invalidation,
            warmer,
            exporter: None,
            config,
            started_at: RwLock::new(started_at),
            tasks: Mutex::new(Vec::new()),
            last_health: RwLock::new(None),
        }
    }

    /// Publish health and usage gauges on every health refresh
    pub fn with_exporter(mut self, exporter: Arc<CacheExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.invalidation
    }

    pub fn warmer(&self) -> &Arc<CacheWarmer> {
        &self.warmer
    }

    pub fn exporter(&self) -> Option<&Arc<CacheExporter>> {
        self.exporter.as_ref()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Assess the latest sub-signals
    pub fn health_status(&self) -> HealthReport {
        let started_at = *self.started_at.read();
        let signals = HealthSignals {
            now: self.store.policy().clock().now(),
            backend_configured: self.store.has_remote(),
            backend_available: self.store.is_remote_available(),
            memory_pressure: self.store.local().memory_pressure(),
            compression_enabled: self.store.codec().is_enabled(),
            warmer_last_run: self.warmer.last_run().unwrap_or(started_at),
            invalidator_last_check: self.invalidation.last_check().unwrap_or(started_at),
        };
        assess(&signals, &self.config.thresholds())
    }

    /// Report from the last periodic health refresh
    pub fn last_health(&self) -> Option<HealthReport> {
        self.last_health.read().clone()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let metrics = self.store.metrics();
        let hit_rate = metrics.hit_rate();
        let miss_rate = if metrics.has_reads() { 1.0 - hit_rate } else { 0.0 };

        let local = self.store.local();
        let keys = local.keys();
        let mut key_distribution = BTreeMap::new();
        for key in &keys {
            *key_distribution.entry(keys::group(key)).or_insert(0) += 1;
        }

        PerformanceMetrics {
            hit_rate,
            miss_rate,
            compression_ratio: self.store.codec().stats().compression_ratio(),
            memory_usage: MemoryUsage {
                used_bytes: local.size_bytes(),
                limit_bytes: local.capacity(),
                percentage: local.memory_pressure() * 100.0,
            },
            key_distribution,
            entries: keys.len(),
            store: metrics.snapshot(),
        }
    }

    // -------------------------------------------------------------------------
    // Remediation
    // -------------------------------------------------------------------------

    /// Free memory, re-warm, re-enable compression and fire the
    /// `optimization` trigger as the current signals call for.
    #[instrument(skip(self))]
    pub async fn optimize(&self) -> OptimizationReport {
        let before = self.performance_metrics();
        let mut actions = Vec::new();
        let local = self.store.local();

        let pressure = local.memory_pressure();
        if pressure > self.config.optimize_memory_threshold {
            let expired = local.cleanup_expired();
            actions.push(format!("Removed {} expired entries", expired));

            if local.memory_pressure() > self.config.optimize_memory_threshold {
                let evicted = local.evict_to_ratio(self.config.optimize_target_ratio);
                actions.push(format!("Evicted {} oldest entries", evicted));
            }
        }

        if before.hit_rate < self.config.low_hit_rate {
            let report = self.warmer.run_cycle().await;
            actions.push(format!(
                "Re-warmed cache: {} completed, {} failed, {} skipped",
                report.completed, report.failed, report.skipped
            ));
        }

        if !self.store.codec().is_enabled() && pressure > self.config.compression_pressure {
            self.store.codec().set_enabled(true);
            actions.push("Enabled compression".to_string());
        }

        let outcome = self.invalidation.invalidate_by_trigger(TRIGGER_OPTIMIZATION).await;
        actions.push(format!(
            "Fired optimization trigger: {} rules matched",
            outcome.rules_matched
        ));

        let after = self.performance_metrics();
        info!(actions = actions.len(), "Cache optimization complete");
        OptimizationReport {
            before,
            after,
            actions,
        }
    }

    /// Flush both tiers, re-enable compression and warm high-priority data
    #[instrument(skip(self))]
    pub async fn emergency_reset(&self) -> CycleReport {
        warn!("Emergency cache reset");
        self.store.flush().await;
        self.store.codec().set_enabled(true);
        self.warmer.warm_high_priority().await
    }

    pub async fn trigger_invalidation(&self, trigger: &str) -> TriggerOutcome {
        self.invalidation.invalidate_by_trigger(trigger).await
    }

    pub async fn invalidate_league(&self, league_id: &str) -> Result<usize> {
        self.invalidation.invalidate_league(league_id).await
    }

    pub async fn warm_now(&self, categories: Option<&[String]>) -> CycleReport {
        self.warmer.warm_now(categories).await
    }

    /// Probe the backend, assess health and publish gauges
    pub async fn refresh_health(&self) -> HealthReport {
        self.store.probe_backend().await;
        let report = self.health_status();

        if let Some(exporter) = &self.exporter {
            let local = self.store.local();
            let warming = self.warmer.stats();
            exporter.update(
                &ExporterSample {
                    hit_rate: self.store.metrics().hit_rate(),
                    memory_used_bytes: local.size_bytes(),
                    memory_limit_bytes: local.capacity(),
                    entries: local.len() as u64,
                    warming_completed: warming.completed,
                    warming_failed: warming.failed,
                    backend_available: self.store.is_remote_available(),
                },
                report.status,
            );
        }

        if !report.status.is_healthy() {
            warn!(status = %report.status, recommendations = ?report.recommendations, "Cache health");
        }
        *self.last_health.write() = Some(report.clone());
        report
    }

    // -------------------------------------------------------------------------
    // Background maintenance
    // -------------------------------------------------------------------------

    /// Start the periodic tasks. They stop on `shutdown` or [`Self::stop`].
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Cache maintenance already running");
            return;
        }

        *self.started_at.write() = self.store.policy().clock().now();

        let policy = self.store.policy().clone();
        let spec = TaskSpec::every(
            "phase-refresh",
            policy.config().phase_refresh_interval,
            self.config.phase_refresh_timeout,
        )
        .with_initial_delay(Duration::ZERO);
        tasks.push(PeriodicTask::start(spec, shutdown, move || {
            let policy = policy.clone();
            async move { policy.refresh_phase().await.map(|_| ()) }
        }));

        let invalidation = self.invalidation.clone();
        let spec = TaskSpec::every(
            "invalidation-check",
            invalidation.config().check_interval,
            invalidation.config().check_timeout,
        );
        tasks.push(PeriodicTask::start(spec, shutdown, move || {
            let invalidation = invalidation.clone();
            async move { invalidation.run_scheduled_check().await.map(|_| ()) }
        }));

        let warmer = self.warmer.clone();
        let interval_source = Arc::downgrade(&warmer);
        let fallback = warmer.config().inactive_interval;
        let spec = TaskSpec::dynamic(
            "cache-warming",
            Arc::new(move || {
                interval_source
                    .upgrade()
                    .map(|w| w.next_interval())
                    .unwrap_or(fallback)
            }),
            warmer.config().cycle_timeout,
        )
        .with_initial_delay(self.config.initial_warm_delay);
        tasks.push(PeriodicTask::start(spec, shutdown, move || {
            let warmer = warmer.clone();
            async move {
                warmer.run_cycle().await;
                Ok(())
            }
        }));

        let manager: Weak<Self> = Arc::downgrade(self);
        let spec = TaskSpec::every(
            "health-refresh",
            self.config.health_refresh_interval,
            self.config.health_timeout,
        );
        tasks.push(PeriodicTask::start(spec, shutdown, move || {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.refresh_health().await;
                }
                Ok(())
            }
        }));

        info!(tasks = tasks.len(), "Cache maintenance started");
    }

    /// Stop every periodic task and wait for them to exit
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.stop().await;
        }
        if !tasks.is_empty() {
            info!("Cache maintenance stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|t| t.is_running())
    }

    /// Runs / failures / timeouts per task name
    pub fn task_stats(&self) -> BTreeMap<String, (u64, u64, u64)> {
        self.tasks
            .lock()
            .iter()
            .map(|t| {
                let s = t.stats();
                (t.name().to_string(), (s.runs(), s.failures(), s.timeouts()))
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
