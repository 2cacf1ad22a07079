//! Cache Warmer
//!
//! Populates the store before callers ask. Each cycle builds a fresh task
//! list (league state first, then league and reference data, then trending
//! data), drops tasks whose key is already cached, and runs the rest in
//! priority order under a concurrency bound and a per-task timeout.
//!
//! A failed or timed out task is counted and logged; its siblings carry on.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::keys;
use super::policy::CacheContext;
use super::store::TieredStore;
use crate::config::duration_secs;
use crate::domain::{Clock, UpstreamFetcher};

/// Execution order within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmingPriority {
    High,
    Medium,
    Low,
}

/// Deferred upstream fetch
pub type Producer = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// One key to populate
pub struct WarmingTask {
    pub key: String,
    pub data_category: String,
    pub priority: WarmingPriority,
    pub description: String,
    /// Week the entity belongs to, for the TTL week adjustment
    pub entity_week: Option<u32>,
    producer: Producer,
}

impl WarmingTask {
    pub fn new<F, Fut>(
        key: impl Into<String>,
        data_category: impl Into<String>,
        priority: WarmingPriority,
        description: impl Into<String>,
        producer: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            key: key.into(),
            data_category: data_category.into(),
            priority,
            description: description.into(),
            entity_week: None,
            producer: Box::new(move || producer().boxed()),
        }
    }

    pub fn with_week(mut self, week: u32) -> Self {
        self.entity_week = Some(week);
        self
    }

    fn context(&self) -> CacheContext {
        let context = CacheContext::new(self.data_category.clone());
        match self.entity_week {
            Some(week) => context.with_week(week),
            None => context,
        }
    }
}

impl fmt::Debug for WarmingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmingTask")
            .field("key", &self.key)
            .field("data_category", &self.data_category)
            .field("priority", &self.priority)
            .field("description", &self.description)
            .finish()
    }
}

// =============================================================================
// Configuration & Stats
// =============================================================================

/// Warmer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub max_concurrent: usize,
    /// Concurrency for targeted league warming
    pub league_max_concurrent: usize,
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    /// Cycle interval while games are being played
    #[serde(with = "duration_secs")]
    pub active_interval: Duration,
    #[serde(with = "duration_secs")]
    pub inactive_interval: Duration,
    /// Hard limit for one scheduled cycle
    #[serde(with = "duration_secs")]
    pub cycle_timeout: Duration,
    pub sport: String,
    /// Leagues warmed on every cycle
    pub tracked_leagues: Vec<String>,
    pub trending_kinds: Vec<String>,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            league_max_concurrent: 2,
            task_timeout: Duration::from_secs(15),
            active_interval: Duration::from_secs(30 * 60),
            inactive_interval: Duration::from_secs(2 * 3600),
            cycle_timeout: Duration::from_secs(15),
            sport: "nfl".to_string(),
            tracked_leagues: Vec::new(),
            trending_kinds: vec!["add".to_string(), "drop".to_string()],
        }
    }
}

/// Cumulative warming counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmingStats {
    pub cycles: u64,
    pub total_tasks: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Subset of `failed` that hit the task timeout
    pub timed_out: u64,
    pub last_cycle_duration: Option<Duration>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Outcome of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub duration: Duration,
}

enum TaskOutcome {
    Completed,
    Failed,
    TimedOut,
}

// =============================================================================
// Warmer
// =============================================================================

pub struct CacheWarmer {
    store: Arc<TieredStore>,
    fetcher: Arc<dyn UpstreamFetcher>,
    clock: Arc<dyn Clock>,
    config: WarmerConfig,
    tracked_leagues: RwLock<Vec<String>>,
    stats: RwLock<WarmingStats>,
}

impl CacheWarmer {
    pub fn new(store: Arc<TieredStore>, fetcher: Arc<dyn UpstreamFetcher>, config: WarmerConfig) -> Self {
        Self {
            clock: store.policy().clock().clone(),
            tracked_leagues: RwLock::new(config.tracked_leagues.clone()),
            store,
            fetcher,
            config,
            stats: RwLock::new(WarmingStats::default()),
        }
    }

    pub fn config(&self) -> &WarmerConfig {
        &self.config
    }

    /// Add a league to every future cycle
    pub fn track_league(&self, league_id: impl Into<String>) {
        let league_id = league_id.into();
        let mut leagues = self.tracked_leagues.write();
        if !leagues.contains(&league_id) {
            leagues.push(league_id);
        }
    }

    pub fn tracked_leagues(&self) -> Vec<String> {
        self.tracked_leagues.read().clone()
    }

    pub fn stats(&self) -> WarmingStats {
        self.stats.read().clone()
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.stats.read().last_run
    }

    /// Delay until the next scheduled cycle
    pub fn next_interval(&self) -> Duration {
        let active = self
            .store
            .policy()
            .league_phase()
            .map(|p| p.phase.is_active())
            .unwrap_or(false);
        if active {
            self.config.active_interval
        } else {
            self.config.inactive_interval
        }
    }

    // -------------------------------------------------------------------------
    // Task lists
    // -------------------------------------------------------------------------

    /// Full task list for one scheduled cycle
    pub fn build_cycle_tasks(&self) -> Vec<WarmingTask> {
        let sport = self.config.sport.clone();
        let week = self
            .store
            .policy()
            .league_phase()
            .filter(|p| p.phase.is_active() && p.week > 0)
            .map(|p| p.week);

        let mut tasks = Vec::new();

        let fetcher = self.fetcher.clone();
        let s = sport.clone();
        tasks.push(WarmingTask::new(
            keys::state(&sport),
            "nfl_state",
            WarmingPriority::High,
            "League calendar state",
            move || async move { fetcher.fetch_state(&s).await },
        ));

        for league_id in self.tracked_leagues() {
            tasks.extend(self.league_tasks(&league_id, week));
        }

        let fetcher = self.fetcher.clone();
        let s = sport.clone();
        tasks.push(WarmingTask::new(
            keys::players(&sport),
            "players",
            WarmingPriority::Medium,
            "Player reference table",
            move || async move { fetcher.fetch_players(&s).await },
        ));

        for kind in &self.config.trending_kinds {
            let fetcher = self.fetcher.clone();
            let (s, k) = (sport.clone(), kind.clone());
            tasks.push(WarmingTask::new(
                keys::trending(&sport, kind),
                "trending",
                WarmingPriority::Low,
                format!("Trending {} players", kind),
                move || async move { fetcher.fetch_trending(&s, &k).await },
            ));
        }

        tasks
    }

    /// Tasks for one league; matchups only when `week` is given
    pub fn league_tasks(&self, league_id: &str, week: Option<u32>) -> Vec<WarmingTask> {
        let id = league_id.to_string();
        let mut tasks = Vec::new();

        let (fetcher, l) = (self.fetcher.clone(), id.clone());
        tasks.push(WarmingTask::new(
            keys::league(&id),
            "league",
            WarmingPriority::High,
            format!("League {} settings", id),
            move || async move { fetcher.fetch_league(&l).await },
        ));

        let (fetcher, l) = (self.fetcher.clone(), id.clone());
        tasks.push(WarmingTask::new(
            keys::roster(&id),
            "roster",
            WarmingPriority::High,
            format!("League {} rosters", id),
            move || async move { fetcher.fetch_rosters(&l).await },
        ));

        let (fetcher, l) = (self.fetcher.clone(), id.clone());
        tasks.push(WarmingTask::new(
            keys::users(&id),
            "user",
            WarmingPriority::Medium,
            format!("League {} members", id),
            move || async move { fetcher.fetch_users(&l).await },
        ));

        if let Some(week) = week {
            let (fetcher, l) = (self.fetcher.clone(), id.clone());
            tasks.push(
                WarmingTask::new(
                    keys::matchup(&id, week),
                    "matchup",
                    WarmingPriority::High,
                    format!("League {} week {} matchups", id, week),
                    move || async move { fetcher.fetch_matchups(&l, week).await },
                )
                .with_week(week),
            );
        }

        tasks
    }

    // -------------------------------------------------------------------------
    // Cycles
    // -------------------------------------------------------------------------

    /// One scheduled cycle
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let tasks = self.build_cycle_tasks();
        self.run_tasks(tasks, self.config.max_concurrent).await
    }

    /// Cycle restricted to `categories` (all when `None`)
    #[instrument(skip(self))]
    pub async fn warm_now(&self, categories: Option<&[String]>) -> CycleReport {
        let mut tasks = self.build_cycle_tasks();
        if let Some(categories) = categories {
            let wanted: HashSet<&str> = categories.iter().map(String::as_str).collect();
            tasks.retain(|t| wanted.contains(t.data_category.as_str()));
        }
        self.run_tasks(tasks, self.config.max_concurrent).await
    }

    /// Only the high-priority part of a cycle
    pub async fn warm_high_priority(&self) -> CycleReport {
        let mut tasks = self.build_cycle_tasks();
        tasks.retain(|t| t.priority == WarmingPriority::High);
        self.run_tasks(tasks, self.config.max_concurrent).await
    }

    /// Targeted warming for specific leagues at lower concurrency
    #[instrument(skip(self))]
    pub async fn warm_league_data(&self, league_ids: &[String], week: Option<u32>) -> CycleReport {
        let tasks = league_ids
            .iter()
            .flat_map(|id| self.league_tasks(id, week))
            .collect();
        self.run_tasks(tasks, self.config.league_max_concurrent).await
    }

    /// Run `tasks` in priority order with at most `concurrency` in flight
    pub async fn run_tasks(&self, tasks: Vec<WarmingTask>, concurrency: usize) -> CycleReport {
        let started = Instant::now();
        let cycle_id = Uuid::new_v4();
        let total = tasks.len();

        let (mut pending, cached): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|t| !self.store.contains(&t.key));
        let skipped = cached.len();
        // Stable: keeps build order within a priority
        pending.sort_by_key(|t| t.priority);

        debug!(%cycle_id, total, skipped, "Starting warming cycle");

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut running = JoinSet::new();
        for task in pending {
            // Acquired in order, so higher priorities start first
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let timeout = self.config.task_timeout;
            running.spawn(async move {
                let _permit = permit;
                execute(store, task, timeout).await
            });
        }

        let (mut completed, mut failed, mut timed_out) = (0, 0, 0);
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(TaskOutcome::Completed) => completed += 1,
                Ok(TaskOutcome::Failed) => failed += 1,
                Ok(TaskOutcome::TimedOut) => {
                    failed += 1;
                    timed_out += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Warming task panicked");
                    failed += 1;
                }
            }
        }

        let report = CycleReport {
            cycle_id,
            total,
            completed,
            failed,
            skipped,
            timed_out,
            duration: started.elapsed(),
        };
        self.record(&report);

        info!(
            %cycle_id,
            total,
            completed,
            failed,
            skipped,
            duration_ms = report.duration.as_millis() as u64,
            "Warming cycle complete"
        );
        report
    }

    fn record(&self, report: &CycleReport) {
        let mut stats = self.stats.write();
        stats.cycles += 1;
        stats.total_tasks += report.total as u64;
        stats.completed += report.completed as u64;
        stats.failed += report.failed as u64;
        stats.skipped += report.skipped as u64;
        stats.timed_out += report.timed_out as u64;
        stats.last_cycle_duration = Some(report.duration);
        stats.last_run = Some(self.clock.now());
    }
}

async fn execute(store: Arc<TieredStore>, task: WarmingTask, timeout: Duration) -> TaskOutcome {
    let context = task.context();
    let WarmingTask {
        key,
        producer,
        description,
        ..
    } = task;

    match tokio::time::timeout(timeout, producer()).await {
        Ok(Ok(value)) => {
            let ttl = store.policy().optimal_ttl(&context);
            match store.set(&key, &value, ttl).await {
                Ok(()) => {
                    debug!(key = %key, "Warmed");
                    TaskOutcome::Completed
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to store warmed value");
                    TaskOutcome::Failed
                }
            }
        }
        Ok(Err(e)) => {
            warn!(key = %key, task = %description, error = %e, "Warming task failed");
            TaskOutcome::Failed
        }
        Err(_) => {
            warn!(key = %key, task = %description, ?timeout, "Warming task timed out");
            TaskOutcome::TimedOut
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::Codec;
    use crate::cache::local::LocalTier;
    use crate::cache::policy::{PolicyConfig, TtlPolicyEngine};
    use crate::domain::{LeaguePhase, SeasonPhase};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        fail_trending: bool,
    }

    impl CountingFetcher {
        fn hit(&self, what: &str) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "source": what }))
        }
    }

    #[async_trait]
    impl UpstreamFetcher for CountingFetcher {
        async fn fetch_state(&self, _sport: &str) -> anyhow::Result<Value> {
            self.hit("state")
        }
        async fn fetch_players(&self, _sport: &str) -> anyhow::Result<Value> {
            self.hit("players")
        }
        async fn fetch_trending(&self, _sport: &str, kind: &str) -> anyhow::Result<Value> {
            if self.fail_trending {
                self.calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("429 Too Many Requests");
            }
            self.hit(kind)
        }
        async fn fetch_league(&self, id: &str) -> anyhow::Result<Value> {
            self.hit(id)
        }
        async fn fetch_rosters(&self, id: &str) -> anyhow::Result<Value> {
            self.hit(id)
        }
        async fn fetch_users(&self, id: &str) -> anyhow::Result<Value> {
            self.hit(id)
        }
        async fn fetch_matchups(&self, id: &str, _week: u32) -> anyhow::Result<Value> {
            self.hit(id)
        }
    }

    fn store() -> Arc<TieredStore> {
        Arc::new(TieredStore::new(
            LocalTier::new(),
            Arc::new(Codec::default()),
            Arc::new(TtlPolicyEngine::new(PolicyConfig::default())),
        ))
    }

    #[tokio::test]
    async fn test_cycle_task_order() {
        let warmer = CacheWarmer::new(
            store(),
            Arc::new(CountingFetcher::default()),
            WarmerConfig {
                tracked_leagues: vec!["42".into()],
                ..Default::default()
            },
        );
        let tasks = warmer.build_cycle_tasks();
        let keys: Vec<_> = tasks.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "state:nfl",
                "league:42",
                "roster:42",
                "users:42",
                "players:nfl",
                "trending:nfl:add",
                "trending:nfl:drop"
            ]
        );
    }

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let fetcher = Arc::new(CountingFetcher::default());
        let warmer = CacheWarmer::new(store(), fetcher.clone(), WarmerConfig::default());

        let first = warmer.run_cycle().await;
        assert_eq!(first.completed, 4);
        let calls = fetcher.calls.load(Ordering::SeqCst);

        let second = warmer.run_cycle().await;
        assert_eq!(second.skipped, 4);
        assert_eq!(second.completed, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);
        assert_eq!(warmer.stats().cycles, 2);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let fetcher = Arc::new(CountingFetcher {
            fail_trending: true,
            ..Default::default()
        });
        let warmer = CacheWarmer::new(store(), fetcher, WarmerConfig::default());

        let report = warmer.run_cycle().await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.completed, 2);
        assert!(warmer.last_run().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout() {
        let warmer = CacheWarmer::new(
            store(),
            Arc::new(CountingFetcher::default()),
            WarmerConfig::default(),
        );
        let slow = WarmingTask::new("player:1", "player", WarmingPriority::Low, "slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        });

        let report = warmer.run_tasks(vec![slow], 1).await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_warm_now_filters_categories() {
        let warmer = CacheWarmer::new(
            store(),
            Arc::new(CountingFetcher::default()),
            WarmerConfig::default(),
        );
        let report = warmer.warm_now(Some(&["trending".to_string()])).await;
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn test_warm_league_data_with_week() {
        let store = store();
        let warmer = CacheWarmer::new(
            store.clone(),
            Arc::new(CountingFetcher::default()),
            WarmerConfig::default(),
        );
        let report = warmer
            .warm_league_data(&["1".to_string(), "2".to_string()], Some(3))
            .await;
        assert_eq!(report.completed, 8);
        assert!(store.contains("matchup:2:3"));
    }

    #[test]
    fn test_next_interval_follows_phase() {
        let store = store();
        let warmer = CacheWarmer::new(
            store.clone(),
            Arc::new(CountingFetcher::default()),
            WarmerConfig::default(),
        );
        assert_eq!(warmer.next_interval(), Duration::from_secs(7200));

        store
            .policy()
            .set_phase(LeaguePhase::new(SeasonPhase::Regular, 4));
        assert_eq!(warmer.next_interval(), Duration::from_secs(1800));
    }
}
