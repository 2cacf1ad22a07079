//! Invalidation Engine
//!
//! Rule-driven eviction. A rule pairs a key regex with the named triggers
//! that fire it and a priority:
//!
//! - `immediate`: matching keys are deleted before the trigger call returns
//! - `scheduled`: deferred by a short delay so bursts of triggers collapse
//!   into one sweep
//! - `batch`: queued until the next periodic check
//!
//! The periodic check derives calendar triggers (week rollover, waiver
//! window entry, game window start/end) from the policy engine's phase
//! snapshot. Each automatic trigger has its own cool-down; manual triggers
//! have none.
//!
//! Patterns are matched against the keys the local tier knows about. Matched
//! keys are deleted from both tiers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::keys;
use super::store::TieredStore;
use crate::config::duration_secs;
use crate::domain::Clock;
use crate::error::Result;

// =============================================================================
// Rules
// =============================================================================

/// When a matched rule takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationPriority {
    Immediate,
    Scheduled,
    Batch,
}

/// Key pattern plus the triggers that evict it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
    /// Regular expression matched against cache keys
    pub key_pattern: String,
    pub triggers: BTreeSet<String>,
    #[serde(default)]
    pub description: String,
    pub priority: InvalidationPriority,
}

impl InvalidationRule {
    pub fn new(
        key_pattern: impl Into<String>,
        triggers: &[&str],
        description: impl Into<String>,
        priority: InvalidationPriority,
    ) -> Self {
        Self {
            key_pattern: key_pattern.into(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            description: description.into(),
            priority,
        }
    }
}

struct CompiledRule {
    rule: InvalidationRule,
    regex: Regex,
}

impl CompiledRule {
    fn compile(rule: InvalidationRule) -> Result<Self> {
        let regex = Regex::new(&rule.key_pattern)?;
        Ok(Self { rule, regex })
    }
}

/// Built-in rules
pub fn default_rules() -> Vec<InvalidationRule> {
    use InvalidationPriority::*;

    vec![
        InvalidationRule::new(
            "^roster:",
            &["roster_update", "transaction", "waiver_processing", "trade"],
            "Rosters change on every transaction",
            Immediate,
        ),
        InvalidationRule::new(
            "^transactions:",
            &["transaction", "waiver_processing", "trade"],
            "Transaction log",
            Immediate,
        ),
        InvalidationRule::new(
            "^matchup:",
            &["game_start", "game_end", "score_update", "week_change"],
            "Live matchup scores",
            Immediate,
        ),
        InvalidationRule::new(
            "^state:",
            &["week_change", "season_change"],
            "League calendar state",
            Immediate,
        ),
        InvalidationRule::new(
            "^league:",
            &["league_update", "season_change"],
            "League settings",
            Immediate,
        ),
        InvalidationRule::new(
            "^trending:",
            &["transaction", "waiver_processing", "optimization"],
            "Trending adds and drops",
            Scheduled,
        ),
        InvalidationRule::new(
            "^player:",
            &["injury_update", "player_update"],
            "Single player details",
            Scheduled,
        ),
        InvalidationRule::new(
            "^(projections|stats):",
            &["week_change", "game_end"],
            "Weekly projections and stats",
            Scheduled,
        ),
        InvalidationRule::new(
            "^bracket:",
            &["game_end", "week_change"],
            "Playoff brackets",
            Scheduled,
        ),
        InvalidationRule::new(
            "^players:",
            &["daily_refresh", "season_change"],
            "Full player table",
            Batch,
        ),
    ]
}

// =============================================================================
// Configuration
// =============================================================================

/// Invalidation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Periodic check interval
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
    /// Hard timeout for one periodic check
    #[serde(with = "duration_secs")]
    pub check_timeout: Duration,
    /// Delay applied to scheduled rules
    #[serde(with = "duration_secs")]
    pub scheduled_delay: Duration,
    /// Cool-down per automatic trigger, in seconds
    pub cooldown_secs: HashMap<String, u64>,
    /// Rules added to the built-in set
    pub extra_rules: Vec<InvalidationRule>,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        let cooldown_secs = [
            (TRIGGER_WEEK_CHANGE, 12 * 3600),
            (TRIGGER_WAIVER_PROCESSING, 6 * 3600),
            (TRIGGER_GAME_START, 3600),
            (TRIGGER_GAME_END, 3600),
        ]
        .into_iter()
        .map(|(t, s)| (t.to_string(), s))
        .collect();

        Self {
            check_interval: Duration::from_secs(300),
            check_timeout: Duration::from_secs(10),
            scheduled_delay: Duration::from_secs(1),
            cooldown_secs,
            extra_rules: Vec::new(),
        }
    }
}

impl InvalidationConfig {
    fn cooldown(&self, trigger: &str) -> Duration {
        Duration::from_secs(self.cooldown_secs.get(trigger).copied().unwrap_or(3600))
    }
}

pub const TRIGGER_WEEK_CHANGE: &str = "week_change";
pub const TRIGGER_WAIVER_PROCESSING: &str = "waiver_processing";
pub const TRIGGER_GAME_START: &str = "game_start";
pub const TRIGGER_GAME_END: &str = "game_end";
pub const TRIGGER_OPTIMIZATION: &str = "optimization";

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time engine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvalidationStats {
    /// Keys deleted
    pub keys_invalidated: u64,
    /// Trigger calls, manual and automatic
    pub triggers_fired: u64,
    /// Automatic triggers suppressed by their cool-down
    pub cooldown_skips: u64,
    pub scheduled_sweeps: u64,
    pub checks_run: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub rules: usize,
    pub pending_scheduled: usize,
    pub pending_batch: usize,
}

/// Result of one trigger call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub rules_matched: usize,
    /// Keys deleted by immediate rules
    pub invalidated: usize,
    /// Patterns deferred by scheduled rules
    pub scheduled: usize,
    /// Patterns queued by batch rules
    pub batched: usize,
}

/// Result of one periodic check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub fired: Vec<String>,
    pub cooled_down: Vec<String>,
    /// Keys deleted by the batch sweep
    pub batch_invalidated: usize,
}

#[derive(Debug, Default)]
struct CalendarState {
    week: Option<u32>,
    waiver_window: bool,
    game_time: bool,
}

// =============================================================================
// Engine
// =============================================================================

pub struct InvalidationEngine {
    store: Arc<TieredStore>,
    clock: Arc<dyn Clock>,
    config: InvalidationConfig,
    rules: RwLock<Vec<CompiledRule>>,
    pending_scheduled: Mutex<BTreeSet<String>>,
    sweep_pending: AtomicBool,
    pending_batch: Mutex<BTreeSet<String>>,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
    calendar: Mutex<CalendarState>,
    last_check: RwLock<Option<DateTime<Utc>>>,
    keys_invalidated: AtomicU64,
    triggers_fired: AtomicU64,
    cooldown_skips: AtomicU64,
    scheduled_sweeps: AtomicU64,
    checks_run: AtomicU64,
}

impl InvalidationEngine {
    /// Build with the default rules plus `config.extra_rules`.
    ///
    /// Fails if any rule pattern is not a valid regex.
    pub fn new(store: Arc<TieredStore>, config: InvalidationConfig) -> Result<Self> {
        let rules = default_rules()
            .into_iter()
            .chain(config.extra_rules.clone())
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            clock: store.policy().clock().clone(),
            store,
            config,
            rules: RwLock::new(rules),
            pending_scheduled: Mutex::new(BTreeSet::new()),
            sweep_pending: AtomicBool::new(false),
            pending_batch: Mutex::new(BTreeSet::new()),
            last_fired: Mutex::new(HashMap::new()),
            calendar: Mutex::new(CalendarState::default()),
            last_check: RwLock::new(None),
            keys_invalidated: AtomicU64::new(0),
            triggers_fired: AtomicU64::new(0),
            cooldown_skips: AtomicU64::new(0),
            scheduled_sweeps: AtomicU64::new(0),
            checks_run: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &InvalidationConfig {
        &self.config
    }

    /// Add a rule at runtime
    pub fn add_rule(&self, rule: InvalidationRule) -> Result<()> {
        let compiled = CompiledRule::compile(rule)?;
        info!(
            pattern = %compiled.rule.key_pattern,
            priority = ?compiled.rule.priority,
            "Added invalidation rule"
        );
        self.rules.write().push(compiled);
        Ok(())
    }

    pub fn rules(&self) -> Vec<InvalidationRule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    /// Fire a named trigger.
    ///
    /// Immediate rules are applied before this returns; scheduled and batch
    /// rules are queued.
    #[instrument(skip(self))]
    pub async fn invalidate_by_trigger(self: &Arc<Self>, trigger: &str) -> TriggerOutcome {
        self.triggers_fired.fetch_add(1, Ordering::Relaxed);

        let mut immediate = Vec::new();
        let mut outcome = TriggerOutcome::default();
        {
            let rules = self.rules.read();
            for compiled in rules.iter().filter(|r| r.rule.triggers.contains(trigger)) {
                outcome.rules_matched += 1;
                match compiled.rule.priority {
                    InvalidationPriority::Immediate => immediate.push(compiled.regex.clone()),
                    InvalidationPriority::Scheduled => {
                        self.pending_scheduled
                            .lock()
                            .insert(compiled.rule.key_pattern.clone());
                        outcome.scheduled += 1;
                    }
                    InvalidationPriority::Batch => {
                        self.pending_batch
                            .lock()
                            .insert(compiled.rule.key_pattern.clone());
                        outcome.batched += 1;
                    }
                }
            }
        }

        if outcome.rules_matched == 0 {
            debug!(trigger, "No invalidation rules for trigger");
            return outcome;
        }

        if outcome.scheduled > 0 {
            self.schedule_sweep();
        }
        outcome.invalidated = self.invalidate_matching(&immediate).await;

        info!(
            trigger,
            rules = outcome.rules_matched,
            invalidated = outcome.invalidated,
            scheduled = outcome.scheduled,
            batched = outcome.batched,
            "Invalidation trigger fired"
        );
        outcome
    }

    /// Delete every key matching `pattern`; returns how many were deleted
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern)?;
        Ok(self.invalidate_matching(&[regex]).await)
    }

    /// Delete every entity-scoped key of one league
    #[instrument(skip(self))]
    pub async fn invalidate_league(&self, league_id: &str) -> Result<usize> {
        let patterns = keys::league_patterns(league_id)
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = self.invalidate_matching(&patterns).await;
        info!(league_id, count, "Invalidated league");
        Ok(count)
    }

    /// One periodic check: derive calendar triggers, honor cool-downs, sweep
    /// queued batch rules.
    #[instrument(skip(self))]
    pub async fn run_scheduled_check(self: &Arc<Self>) -> Result<CheckReport> {
        let now = self.clock.now();
        let mut report = CheckReport::default();

        for trigger in self.calendar_triggers() {
            if self.cooling_down(trigger, now) {
                debug!(trigger, "Trigger in cool-down, skipping");
                self.cooldown_skips.fetch_add(1, Ordering::Relaxed);
                report.cooled_down.push(trigger.to_string());
                continue;
            }
            self.last_fired.lock().insert(trigger.to_string(), now);
            self.invalidate_by_trigger(trigger).await;
            report.fired.push(trigger.to_string());
        }

        report.batch_invalidated = self.sweep_batch().await;
        *self.last_check.write() = Some(now);
        self.checks_run.fetch_add(1, Ordering::Relaxed);

        debug!(?report, "Invalidation check complete");
        Ok(report)
    }

    /// Last completed periodic check
    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.read()
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            keys_invalidated: self.keys_invalidated.load(Ordering::Relaxed),
            triggers_fired: self.triggers_fired.load(Ordering::Relaxed),
            cooldown_skips: self.cooldown_skips.load(Ordering::Relaxed),
            scheduled_sweeps: self.scheduled_sweeps.load(Ordering::Relaxed),
            checks_run: self.checks_run.load(Ordering::Relaxed),
            last_check: self.last_check(),
            rules: self.rules.read().len(),
            pending_scheduled: self.pending_scheduled.lock().len(),
            pending_batch: self.pending_batch.lock().len(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn calendar_triggers(&self) -> Vec<&'static str> {
        let snapshot = self.store.policy().temporal_snapshot();
        let mut state = self.calendar.lock();
        let mut triggers = Vec::new();

        if let Some(phase) = &snapshot.phase {
            if state.week.is_some_and(|w| w != phase.week) {
                triggers.push(TRIGGER_WEEK_CHANGE);
            }
            state.week = Some(phase.week);

            if phase.phase.is_active() {
                if snapshot.game_time && !state.game_time {
                    triggers.push(TRIGGER_GAME_START);
                } else if !snapshot.game_time && state.game_time {
                    triggers.push(TRIGGER_GAME_END);
                }
                if snapshot.waiver_window && !state.waiver_window {
                    triggers.push(TRIGGER_WAIVER_PROCESSING);
                }
            }
        }

        state.game_time = snapshot.game_time;
        state.waiver_window = snapshot.waiver_window;
        triggers
    }

    fn cooling_down(&self, trigger: &str, now: DateTime<Utc>) -> bool {
        let cooldown = self.config.cooldown(trigger);
        self.last_fired
            .lock()
            .get(trigger)
            .and_then(|at| (now - *at).to_std().ok())
            .map(|elapsed| elapsed < cooldown)
            .unwrap_or(false)
    }

    fn schedule_sweep(self: &Arc<Self>) {
        if self.sweep_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(engine.config.scheduled_delay).await;
            engine.sweep_pending.store(false, Ordering::Release);

            let patterns = std::mem::take(&mut *engine.pending_scheduled.lock());
            let count = engine.invalidate_patterns(&patterns).await;
            engine.scheduled_sweeps.fetch_add(1, Ordering::Relaxed);
            debug!(patterns = patterns.len(), count, "Scheduled invalidation sweep");
        });
    }

    async fn sweep_batch(&self) -> usize {
        let patterns = std::mem::take(&mut *self.pending_batch.lock());
        if patterns.is_empty() {
            return 0;
        }
        self.invalidate_patterns(&patterns).await
    }

    async fn invalidate_patterns(&self, patterns: &BTreeSet<String>) -> usize {
        let regexes: Vec<Regex> = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Skipping invalid pattern");
                    None
                }
            })
            .collect();
        self.invalidate_matching(&regexes).await
    }

    async fn invalidate_matching(&self, patterns: &[Regex]) -> usize {
        if patterns.is_empty() {
            return 0;
        }

        let mut count = 0;
        for key in self.store.local_keys() {
            if patterns.iter().any(|p| p.is_match(&key)) && self.store.del(&key).await {
                count += 1;
            }
        }

        self.keys_invalidated
            .fetch_add(count as u64, Ordering::Relaxed);
        count
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
    use crate::domain::{LeaguePhase, ManualClock, SeasonPhase};
    use chrono::TimeZone;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn setup(now: DateTime<Utc>) -> (Arc<InvalidationEngine>, Arc<TieredStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let policy = Arc::new(TtlPolicyEngine::with_clock(
            PolicyConfig::default(),
            clock.clone(),
        ));
        let store = Arc::new(TieredStore::new(
            LocalTier::new(),
            Arc::new(Codec::default()),
            policy,
        ));
        let engine =
            Arc::new(InvalidationEngine::new(store.clone(), InvalidationConfig::default()).unwrap());
        (engine, store, clock)
    }

    fn tuesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 8, 15, 0, 0).unwrap()
    }

    async fn seed(store: &TieredStore, keys: &[&str]) {
        for key in keys {
            store.set(key, &json!({"k": key}), HOUR).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pattern_isolation() {
        let (engine, store, _) = setup(tuesday());
        seed(&store, &["foo:1", "foo:2", "bar:1"]).await;

        assert_eq!(engine.invalidate_by_pattern("^foo:").await.unwrap(), 2);
        assert!(store.contains("bar:1"));
        assert!(!store.contains("foo:1"));
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let (engine, _, _) = setup(tuesday());
        let err = engine.invalidate_by_pattern("(").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn test_immediate_trigger() {
        let (engine, store, _) = setup(tuesday());
        seed(&store, &["roster:1", "transactions:1:5", "league:1"]).await;

        let outcome = engine.invalidate_by_trigger("trade").await;
        assert_eq!(outcome.invalidated, 2);
        assert!(store.contains("league:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_trigger_is_deferred_and_coalesced() {
        let (engine, store, _) = setup(tuesday());
        seed(&store, &["trending:nfl:add", "roster:1"]).await;

        let outcome = engine.invalidate_by_trigger("transaction").await;
        engine.invalidate_by_trigger("transaction").await;
        assert_eq!(outcome.scheduled, 1);
        assert!(!store.contains("roster:1"));
        assert!(store.contains("trending:nfl:add"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!store.contains("trending:nfl:add"));
        assert_eq!(engine.stats().scheduled_sweeps, 1);
    }

    #[tokio::test]
    async fn test_batch_trigger_waits_for_check() {
        let (engine, store, _) = setup(tuesday());
        seed(&store, &["players:nfl"]).await;

        let outcome = engine.invalidate_by_trigger("daily_refresh").await;
        assert_eq!(outcome.batched, 1);
        assert!(store.contains("players:nfl"));

        let report = engine.run_scheduled_check().await.unwrap();
        assert_eq!(report.batch_invalidated, 1);
        assert!(!store.contains("players:nfl"));
        assert!(engine.last_check().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_league() {
        let (engine, store, _) = setup(tuesday());
        seed(
            &store,
            &["roster:7", "users:7", "matchup:7:3", "league:7", "roster:77", "players:nfl"],
        )
        .await;

        assert_eq!(engine.invalidate_league("7").await.unwrap(), 4);
        assert!(store.contains("roster:77"));
        assert!(store.contains("players:nfl"));
    }

    #[tokio::test]
    async fn test_week_change_with_cooldown() {
        let (engine, store, clock) = setup(tuesday());
        let policy = store.policy().clone();

        policy.set_phase(LeaguePhase::new(SeasonPhase::Regular, 5));
        let report = engine.run_scheduled_check().await.unwrap();
        assert!(report.fired.is_empty());

        seed(&store, &["matchup:1:5", "state:nfl"]).await;
        policy.set_phase(LeaguePhase::new(SeasonPhase::Regular, 6));
        let report = engine.run_scheduled_check().await.unwrap();
        assert_eq!(report.fired, vec![TRIGGER_WEEK_CHANGE.to_string()]);
        assert!(!store.contains("state:nfl"));

        // A second rollover inside the 12 hour cool-down is suppressed
        clock.advance(Duration::from_secs(3600));
        policy.set_phase(LeaguePhase::new(SeasonPhase::Regular, 7));
        let report = engine.run_scheduled_check().await.unwrap();
        assert_eq!(report.cooled_down, vec![TRIGGER_WEEK_CHANGE.to_string()]);
    }

    #[tokio::test]
    async fn test_game_triggers_need_active_season() {
        // Sunday 13:00 league time
        let sunday = Utc.with_ymd_and_hms(2024, 10, 6, 18, 0, 0).unwrap();
        let (engine, store, clock) = setup(sunday);

        store.policy().set_phase(LeaguePhase::new(SeasonPhase::Off, 0));
        assert!(engine.run_scheduled_check().await.unwrap().fired.is_empty());

        clock.set(tuesday());
        engine.run_scheduled_check().await.unwrap();
        store.policy().set_phase(LeaguePhase::new(SeasonPhase::Regular, 0));
        clock.set(sunday + chrono::Duration::days(7));
        let report = engine.run_scheduled_check().await.unwrap();
        assert_eq!(report.fired, vec![TRIGGER_GAME_START.to_string()]);
    }

    #[tokio::test]
    async fn test_waiver_trigger_needs_active_season() {
        // Wednesday 03:00 league time, inside the waiver window
        let wednesday = Utc.with_ymd_and_hms(2024, 10, 9, 8, 0, 0).unwrap();
        let (engine, store, clock) = setup(tuesday());
        seed(&store, &["transactions:1"]).await;

        store.policy().set_phase(LeaguePhase::new(SeasonPhase::Off, 0));
        engine.run_scheduled_check().await.unwrap();
        clock.set(wednesday);
        let report = engine.run_scheduled_check().await.unwrap();
        assert!(report.fired.is_empty());
        assert!(store.contains("transactions:1"));

        // Next week's window opens during the season
        clock.set(tuesday() + chrono::Duration::days(7));
        store.policy().set_phase(LeaguePhase::new(SeasonPhase::Regular, 1));
        engine.run_scheduled_check().await.unwrap();
        clock.set(wednesday + chrono::Duration::days(7));
        let report = engine.run_scheduled_check().await.unwrap();
        assert_eq!(report.fired, vec![TRIGGER_WAIVER_PROCESSING.to_string()]);
    }

    #[tokio::test]
    async fn test_add_rule() {
        let (engine, store, _) = setup(tuesday());
        let before = engine.rules().len();
        engine
            .add_rule(InvalidationRule::new(
                "^draft:",
                &["draft_pick"],
                "Live drafts",
                InvalidationPriority::Immediate,
            ))
            .unwrap();
        assert_eq!(engine.rules().len(), before + 1);

        seed(&store, &["draft:1"]).await;
        assert_eq!(engine.invalidate_by_trigger("draft_pick").await.invalidated, 1);
    }
}
