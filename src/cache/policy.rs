//! TTL Policy Engine
//!
//! Maps a data category and the current point in the league calendar to a
//! time-to-live. The calendar comes from a cached [`LeaguePhase`] snapshot
//! that is refreshed on a bounded interval from a [`PhaseFeed`], never
//! fetched while computing a TTL.
//!
//! # Algorithm
//!
//! ```text
//! off-season (pre/off)            -> off_season_ttl
//! roster in waiver window       -> waiver_time_ttl
//! game window                     -> game_time_ttl
//! otherwise                       -> base_ttl
//!
//! entity_week == current week     -> x 0.5
//! entity_week >  current week     -> x 1.5
//! result                          -> max(result, 30s)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{duration_secs, duration_secs_opt};
use crate::domain::{Clock, LeaguePhase, PhaseFeed, SystemClock};
use crate::error::{Error, Result};

/// Shortest TTL the engine ever returns
pub const MIN_TTL: Duration = Duration::from_secs(30);

/// TTL for categories with no strategy
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Shortest allowed phase refresh interval
pub const MIN_PHASE_REFRESH: Duration = Duration::from_secs(300);

/// Only this category uses `waiver_time_ttl`
pub const WAIVER_CATEGORY: &str = "roster";

// =============================================================================
// Strategy
// =============================================================================

/// Per-category TTLs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlStrategy {
    #[serde(with = "duration_secs")]
    pub base_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub game_time_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub off_season_ttl: Duration,
    /// No waiver-window behavior when absent
    #[serde(default, with = "duration_secs_opt")]
    pub waiver_time_ttl: Option<Duration>,
}

impl TtlStrategy {
    pub fn new(base_secs: u64, game_secs: u64, off_season_secs: u64) -> Self {
        Self {
            base_ttl: Duration::from_secs(base_secs),
            game_time_ttl: Duration::from_secs(game_secs),
            off_season_ttl: Duration::from_secs(off_season_secs),
            waiver_time_ttl: None,
        }
    }

    pub fn with_waiver(mut self, waiver_secs: u64) -> Self {
        self.waiver_time_ttl = Some(Duration::from_secs(waiver_secs));
        self
    }

    /// All durations must be positive
    pub fn validate(&self, category: &str) -> Result<()> {
        let zero = [
            ("base_ttl", Some(self.base_ttl)),
            ("game_time_ttl", Some(self.game_time_ttl)),
            ("off_season_ttl", Some(self.off_season_ttl)),
            ("waiver_time_ttl", self.waiver_time_ttl),
        ]
        .into_iter()
        .find(|(_, ttl)| *ttl == Some(Duration::ZERO));

        match zero {
            Some((field, _)) => Err(Error::Config(format!(
                "strategy '{}': {} must be positive",
                category, field
            ))),
            None => Ok(()),
        }
    }
}

/// Built-in strategy table
pub fn default_strategies() -> HashMap<String, TtlStrategy> {
    const HOUR: u64 = 3600;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;

    [
        ("nfl_state", TtlStrategy::new(HOUR, 300, DAY)),
        ("league", TtlStrategy::new(HOUR, 1800, DAY)),
        ("roster", TtlStrategy::new(1800, 300, DAY).with_waiver(120)),
        ("matchup", TtlStrategy::new(HOUR, 60, DAY)),
        ("player", TtlStrategy::new(DAY, HOUR, WEEK)),
        ("players", TtlStrategy::new(DAY, 12 * HOUR, WEEK)),
        ("trending", TtlStrategy::new(1800, 600, 6 * HOUR)),
        ("user", TtlStrategy::new(DAY, DAY, WEEK)),
        ("transaction", TtlStrategy::new(900, 300, DAY)),
        ("draft", TtlStrategy::new(HOUR, HOUR, DAY)),
        ("bracket", TtlStrategy::new(HOUR, 600, DAY)),
        ("stats", TtlStrategy::new(HOUR, 120, WEEK)),
        ("projections", TtlStrategy::new(HOUR, 900, DAY)),
    ]
    .into_iter()
    .map(|(name, strategy)| (name.to_string(), strategy))
    .collect()
}

// =============================================================================
// Calendar Windows
// =============================================================================

/// Hours `[start_hour, end_hour)` on one weekday, in league-local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub weekday: Weekday,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub const fn new(weekday: Weekday, start_hour: u32, end_hour: u32) -> Self {
        Self {
            weekday,
            start_hour,
            end_hour,
        }
    }

    pub fn contains(&self, local: &DateTime<FixedOffset>) -> bool {
        local.weekday() == self.weekday
            && local.hour() >= self.start_hour
            && local.hour() < self.end_hour
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Policy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Overrides and additions merged over the built-in table
    pub strategies: HashMap<String, TtlStrategy>,
    pub game_windows: Vec<TimeWindow>,
    pub waiver_windows: Vec<TimeWindow>,
    /// League-local UTC offset used for window checks
    pub utc_offset_hours: i32,
    #[serde(with = "duration_secs")]
    pub phase_refresh_interval: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strategies: HashMap::new(),
            game_windows: vec![
                TimeWindow::new(Weekday::Thu, 20, 24),
                TimeWindow::new(Weekday::Sun, 13, 24),
                TimeWindow::new(Weekday::Mon, 20, 24),
            ],
            waiver_windows: vec![TimeWindow::new(Weekday::Wed, 0, 12)],
            utc_offset_hours: -5,
            phase_refresh_interval: MIN_PHASE_REFRESH,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(Error::Config(format!(
                "utc_offset_hours {} out of range",
                self.utc_offset_hours
            )));
        }
        for window in self.game_windows.iter().chain(&self.waiver_windows) {
            if window.start_hour >= window.end_hour || window.end_hour > 24 {
                return Err(Error::Config(format!("invalid time window {:?}", window)));
            }
        }
        for (category, strategy) in &self.strategies {
            strategy.validate(category)?;
        }
        Ok(())
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or(Utc.fix())
    }
}

// =============================================================================
// Context
// =============================================================================

/// What a TTL is being computed for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContext {
    pub data_category: String,
    /// Week the cached entity belongs to, if any
    pub entity_week: Option<u32>,
}

impl CacheContext {
    pub fn new(data_category: impl Into<String>) -> Self {
        Self {
            data_category: data_category.into(),
            entity_week: None,
        }
    }

    pub fn with_week(mut self, week: u32) -> Self {
        self.entity_week = Some(week);
        self
    }
}

/// Calendar state at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalSnapshot {
    pub now: DateTime<Utc>,
    /// `None` until the first successful phase refresh
    pub phase: Option<LeaguePhase>,
    pub game_time: bool,
    pub waiver_window: bool,
}

/// Compute a TTL from one strategy and a calendar snapshot
pub fn ttl_for(
    category: &str,
    strategy: &TtlStrategy,
    context: &CacheContext,
    snapshot: &TemporalSnapshot,
) -> Duration {
    let off_season = snapshot
        .phase
        .as_ref()
        .map(|p| p.phase.is_off_season())
        .unwrap_or(false);

    let mut ttl = if off_season {
        strategy.off_season_ttl
    } else if let (true, Some(waiver)) = (
        snapshot.waiver_window && category == WAIVER_CATEGORY,
        strategy.waiver_time_ttl,
    ) {
        waiver
    } else if snapshot.game_time {
        strategy.game_time_ttl
    } else {
        strategy.base_ttl
    };

    if let (false, Some(phase), Some(week)) =
        (off_season, snapshot.phase.as_ref(), context.entity_week)
    {
        if week == phase.week {
            ttl /= 2;
        } else if week > phase.week {
            ttl = ttl.mul_f64(1.5);
        }
    }

    let ttl = ttl.max(MIN_TTL);
    debug!(category, ttl_secs = ttl.as_secs(), "Computed TTL");
    ttl
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone)]
struct PhaseSnapshot {
    phase: LeaguePhase,
    fetched_at: DateTime<Utc>,
}

/// Calendar-aware TTL engine
pub struct TtlPolicyEngine {
    config: PolicyConfig,
    strategies: RwLock<HashMap<String, TtlStrategy>>,
    phase: RwLock<Option<PhaseSnapshot>>,
    feed: Option<Arc<dyn PhaseFeed>>,
    clock: Arc<dyn Clock>,
}

impl TtlPolicyEngine {
    /// Engine with no phase feed; the phase is only set through [`Self::set_phase`]
    pub fn new(config: PolicyConfig) -> Self {
        Self::build(config, None, Arc::new(SystemClock))
    }

    pub fn with_feed(config: PolicyConfig, feed: Arc<dyn PhaseFeed>, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, Some(feed), clock)
    }

    pub fn with_clock(config: PolicyConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, None, clock)
    }

    fn build(
        mut config: PolicyConfig,
        feed: Option<Arc<dyn PhaseFeed>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if config.phase_refresh_interval < MIN_PHASE_REFRESH {
            warn!(
                requested_secs = config.phase_refresh_interval.as_secs(),
                "Phase refresh interval below minimum, clamping"
            );
            config.phase_refresh_interval = MIN_PHASE_REFRESH;
        }

        let mut strategies = default_strategies();
        strategies.extend(config.strategies.clone());

        Self {
            config,
            strategies: RwLock::new(strategies),
            phase: RwLock::new(None),
            feed,
            clock,
        }
    }

    /// Add or replace a category strategy
    pub fn register_strategy(&self, category: impl Into<String>, strategy: TtlStrategy) -> Result<()> {
        let category = category.into();
        strategy.validate(&category)?;
        info!(category = %category, "Registered TTL strategy");
        self.strategies.write().insert(category, strategy);
        Ok(())
    }

    pub fn strategy(&self, category: &str) -> Option<TtlStrategy> {
        self.strategies.read().get(category).cloned()
    }

    /// Known categories, sorted
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<_> = self.strategies.read().keys().cloned().collect();
        categories.sort();
        categories
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -------------------------------------------------------------------------
    // Phase snapshot
    // -------------------------------------------------------------------------

    /// Last known league phase
    pub fn league_phase(&self) -> Option<LeaguePhase> {
        self.phase.read().as_ref().map(|s| s.phase.clone())
    }

    /// Replace the phase snapshot directly
    pub fn set_phase(&self, phase: LeaguePhase) {
        let fetched_at = self.clock.now();
        *self.phase.write() = Some(PhaseSnapshot { phase, fetched_at });
    }

    /// When the snapshot was last replaced
    pub fn phase_fetched_at(&self) -> Option<DateTime<Utc>> {
        self.phase.read().as_ref().map(|s| s.fetched_at)
    }

    /// Poll the feed and replace the snapshot. On failure the old snapshot stays.
    #[instrument(skip(self))]
    pub async fn refresh_phase(&self) -> Result<Option<LeaguePhase>> {
        let Some(feed) = &self.feed else {
            return Ok(self.league_phase());
        };

        let phase = feed.current_phase().await?;
        let previous = self.league_phase();
        if previous.as_ref() != Some(&phase) {
            info!(phase = %phase.phase, week = phase.week, "League phase changed");
        }
        self.set_phase(phase.clone());
        Ok(Some(phase))
    }

    /// Refresh only if the snapshot is missing or older than the refresh interval
    pub async fn refresh_if_stale(&self) -> Result<Option<LeaguePhase>> {
        let stale = match self.phase_fetched_at() {
            None => true,
            Some(at) => {
                let age = (self.clock.now() - at).to_std().unwrap_or(Duration::ZERO);
                age >= self.config.phase_refresh_interval
            }
        };
        if stale {
            self.refresh_phase().await
        } else {
            Ok(self.league_phase())
        }
    }

    // -------------------------------------------------------------------------
    // Calendar
    // -------------------------------------------------------------------------

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.clock.now().with_timezone(&self.config.offset())
    }

    pub fn is_game_time(&self) -> bool {
        let now = self.local_now();
        self.config.game_windows.iter().any(|w| w.contains(&now))
    }

    pub fn is_waiver_window(&self) -> bool {
        let now = self.local_now();
        self.config.waiver_windows.iter().any(|w| w.contains(&now))
    }

    pub fn temporal_snapshot(&self) -> TemporalSnapshot {
        TemporalSnapshot {
            now: self.clock.now(),
            phase: self.league_phase(),
            game_time: self.is_game_time(),
            waiver_window: self.is_waiver_window(),
        }
    }

    // -------------------------------------------------------------------------
    // TTL
    // -------------------------------------------------------------------------

    /// TTL for `context` at the current instant
    pub fn optimal_ttl(&self, context: &CacheContext) -> Duration {
        let Some(strategy) = self.strategy(&context.data_category) else {
            warn!(
                category = %context.data_category,
                "No TTL strategy for category, using default"
            );
            return DEFAULT_TTL;
        };
        ttl_for(
            &context.data_category,
            &strategy,
            context,
            &self.temporal_snapshot(),
        )
    }

    /// TTL for a category with no entity week
    pub fn contextual_ttl(&self, category: &str) -> Duration {
        self.optimal_ttl(&CacheContext::new(category))
    }
}

impl Default for TtlPolicyEngine {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ManualClock, SeasonPhase, StaticPhaseFeed};
    use chrono::TimeZone;

    /// Sunday 2024-10-06 18:00 UTC = 13:00 league time (game window)
    fn sunday_game() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 6, 18, 0, 0).unwrap()
    }

    /// Tuesday 2024-10-08 15:00 UTC (no window)
    fn tuesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 8, 15, 0, 0).unwrap()
    }

    /// Wednesday 2024-10-09 08:00 UTC = 03:00 league time (waiver window)
    fn wednesday_waivers() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 9, 8, 0, 0).unwrap()
    }

    fn engine_at(now: DateTime<Utc>, phase: SeasonPhase, week: u32) -> TtlPolicyEngine {
        let engine =
            TtlPolicyEngine::with_clock(PolicyConfig::default(), Arc::new(ManualClock::new(now)));
        engine.set_phase(LeaguePhase::new(phase, week));
        engine
    }

    #[test]
    fn test_windows() {
        let engine = engine_at(sunday_game(), SeasonPhase::Regular, 5);
        assert!(engine.is_game_time());
        assert!(!engine.is_waiver_window());

        let engine = engine_at(wednesday_waivers(), SeasonPhase::Regular, 5);
        assert!(engine.is_waiver_window());
        assert!(!engine.is_game_time());

        // Sunday 16:00 UTC is 11:00 league time, before kickoff
        let before = Utc.with_ymd_and_hms(2024, 10, 6, 16, 0, 0).unwrap();
        assert!(!engine_at(before, SeasonPhase::Regular, 5).is_game_time());
    }

    #[test]
    fn test_matchup_game_time_vs_base() {
        let engine = engine_at(sunday_game(), SeasonPhase::Regular, 5);
        assert_eq!(engine.contextual_ttl("matchup"), Duration::from_secs(60));

        let engine = engine_at(tuesday(), SeasonPhase::Regular, 5);
        assert_eq!(engine.contextual_ttl("matchup"), Duration::from_secs(3600));
    }

    #[test]
    fn test_entity_week_adjustment() {
        let engine = engine_at(tuesday(), SeasonPhase::Regular, 5);

        let current = CacheContext::new("matchup").with_week(5);
        assert_eq!(engine.optimal_ttl(&current), Duration::from_secs(1800));

        let future = CacheContext::new("matchup").with_week(6);
        assert_eq!(engine.optimal_ttl(&future), Duration::from_secs(5400));

        let past = CacheContext::new("matchup").with_week(4);
        assert_eq!(engine.optimal_ttl(&past), Duration::from_secs(3600));
    }

    #[test]
    fn test_floor_applies_after_halving() {
        let engine = engine_at(sunday_game(), SeasonPhase::Regular, 5);
        let ctx = CacheContext::new("matchup").with_week(5);
        assert_eq!(engine.optimal_ttl(&ctx), MIN_TTL);
    }

    #[test]
    fn test_off_season_dominates() {
        for phase in [SeasonPhase::Pre, SeasonPhase::Off] {
            let engine = engine_at(sunday_game(), phase, 5);
            let ctx = CacheContext::new("roster").with_week(5);
            assert_eq!(engine.optimal_ttl(&ctx), Duration::from_secs(86400));
        }
    }

    #[test]
    fn test_waiver_window_roster() {
        let engine = engine_at(wednesday_waivers(), SeasonPhase::Regular, 5);
        assert_eq!(engine.contextual_ttl("roster"), Duration::from_secs(120));
        // No waiver TTL: base applies
        assert_eq!(engine.contextual_ttl("league"), Duration::from_secs(3600));
    }

    #[test]
    fn test_waiver_window_ignored_outside_roster() {
        let engine = engine_at(wednesday_waivers(), SeasonPhase::Regular, 5);
        assert_eq!(engine.contextual_ttl("transaction"), Duration::from_secs(900));

        engine
            .register_strategy("claims", TtlStrategy::new(600, 300, 3600).with_waiver(45))
            .unwrap();
        assert_eq!(engine.contextual_ttl("claims"), Duration::from_secs(600));
    }

    #[test]
    fn test_unknown_category_default() {
        let engine = engine_at(tuesday(), SeasonPhase::Regular, 5);
        assert_eq!(engine.contextual_ttl("mystery"), DEFAULT_TTL);
    }

    #[test]
    fn test_register_strategy() {
        let engine = engine_at(tuesday(), SeasonPhase::Regular, 5);
        engine
            .register_strategy("news", TtlStrategy::new(600, 120, 3600))
            .unwrap();
        assert_eq!(engine.contextual_ttl("news"), Duration::from_secs(600));

        let err = engine
            .register_strategy("broken", TtlStrategy::new(0, 1, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_overrides_merge() {
        let mut config = PolicyConfig::default();
        config
            .strategies
            .insert("matchup".into(), TtlStrategy::new(100, 40, 1000));
        let engine = TtlPolicyEngine::with_clock(config, Arc::new(ManualClock::new(tuesday())));
        assert_eq!(engine.strategy("matchup").unwrap().base_ttl.as_secs(), 100);
        assert!(engine.strategy("roster").is_some());
    }

    #[test]
    fn test_refresh_interval_clamped() {
        let config = PolicyConfig {
            phase_refresh_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let engine = TtlPolicyEngine::new(config);
        assert_eq!(engine.config().phase_refresh_interval, MIN_PHASE_REFRESH);
    }

    #[tokio::test]
    async fn test_refresh_if_stale() {
        let clock = Arc::new(ManualClock::new(tuesday()));
        let feed = Arc::new(StaticPhaseFeed::new(LeaguePhase::new(SeasonPhase::Regular, 3)));
        let engine = TtlPolicyEngine::with_feed(PolicyConfig::default(), feed.clone(), clock.clone());

        assert!(engine.league_phase().is_none());
        engine.refresh_if_stale().await.unwrap();
        assert_eq!(engine.league_phase().unwrap().week, 3);

        feed.set(LeaguePhase::new(SeasonPhase::Regular, 4));
        engine.refresh_if_stale().await.unwrap();
        assert_eq!(engine.league_phase().unwrap().week, 3);

        clock.advance(Duration::from_secs(301));
        engine.refresh_if_stale().await.unwrap();
        assert_eq!(engine.league_phase().unwrap().week, 4);
    }
}
