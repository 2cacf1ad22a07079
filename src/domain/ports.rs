//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over everything the cache consumes from the outside world:
//! the wall clock, the league phase feed and the upstream data source used
//! to build warming producers. Adapters implement these traits; tests use
//! the in-process implementations defined here.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Subsystem                         │
//! │      TTL Policy │ Invalidation │ Warmer │ Manager           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Ports (This Module)                       │
//! │        Clock │ PhaseFeed │ UpstreamFetcher                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Season phase reported by the league state feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonPhase {
    /// Pre-season
    Pre,
    /// Regular season
    Regular,
    /// Playoffs
    Post,
    /// Between seasons
    Off,
}

impl SeasonPhase {
    /// Pre-season and off-season both count as "off" for TTL purposes.
    pub fn is_off_season(&self) -> bool {
        matches!(self, SeasonPhase::Pre | SeasonPhase::Off)
    }

    /// Games are being played.
    pub fn is_active(&self) -> bool {
        matches!(self, SeasonPhase::Regular | SeasonPhase::Post)
    }
}

impl fmt::Display for SeasonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeasonPhase::Pre => write!(f, "pre"),
            SeasonPhase::Regular => write!(f, "regular"),
            SeasonPhase::Post => write!(f, "post"),
            SeasonPhase::Off => write!(f, "off"),
        }
    }
}

/// Snapshot of the league calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaguePhase {
    /// Season phase
    #[serde(alias = "season_type")]
    pub phase: SeasonPhase,
    /// Current week number
    #[serde(alias = "current_week")]
    pub week: u32,
}

impl LeaguePhase {
    pub fn new(phase: SeasonPhase, week: u32) -> Self {
        Self { phase, week }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let by = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// League Phase Feed
// =============================================================================

/// Polled source of the league calendar.
#[async_trait]
pub trait PhaseFeed: Send + Sync {
    async fn current_phase(&self) -> Result<LeaguePhase>;
}

/// Feed returning whatever phase was last set on it.
#[derive(Debug)]
pub struct StaticPhaseFeed {
    phase: RwLock<LeaguePhase>,
}

impl StaticPhaseFeed {
    pub fn new(phase: LeaguePhase) -> Self {
        Self {
            phase: RwLock::new(phase),
        }
    }

    pub fn set(&self, phase: LeaguePhase) {
        *self.phase.write() = phase;
    }
}

#[async_trait]
impl PhaseFeed for StaticPhaseFeed {
    async fn current_phase(&self) -> Result<LeaguePhase> {
        Ok(self.phase.read().clone())
    }
}

// =============================================================================
// Upstream Fetcher
// =============================================================================

/// Upstream data source the warmer builds producers from.
///
/// Every call is opaque to the cache: it may be slow, rate limited or fail,
/// and its errors are only ever counted, never interpreted.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Current league state for a sport
    async fn fetch_state(&self, sport: &str) -> anyhow::Result<serde_json::Value>;

    /// Full player reference table for a sport
    async fn fetch_players(&self, sport: &str) -> anyhow::Result<serde_json::Value>;

    /// Trending players (`kind` is "add" or "drop")
    async fn fetch_trending(&self, sport: &str, kind: &str) -> anyhow::Result<serde_json::Value>;

    /// League settings
    async fn fetch_league(&self, league_id: &str) -> anyhow::Result<serde_json::Value>;

    /// League rosters
    async fn fetch_rosters(&self, league_id: &str) -> anyhow::Result<serde_json::Value>;

    /// League members
    async fn fetch_users(&self, league_id: &str) -> anyhow::Result<serde_json::Value>;

    /// Matchups for one week
    async fn fetch_matchups(&self, league_id: &str, week: u32)
        -> anyhow::Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_season_phase_classification() {
        assert!(SeasonPhase::Pre.is_off_season());
        assert!(SeasonPhase::Off.is_off_season());
        assert!(!SeasonPhase::Regular.is_off_season());
        assert!(SeasonPhase::Post.is_active());
        assert!(!SeasonPhase::Pre.is_active());
    }

    #[test]
    fn test_league_phase_deserializes_feed_aliases() {
        let json = r#"{"season_type":"regular","current_week":10}"#;
        let phase: LeaguePhase = serde_json::from_str(json).unwrap();
        assert_eq!(phase, LeaguePhase::new(SeasonPhase::Regular, 10));

        let json = r#"{"phase":"off","week":0}"#;
        let phase: LeaguePhase = serde_json::from_str(json).unwrap();
        assert_eq!(phase.phase, SeasonPhase::Off);
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc.with_ymd_and_hms(2024, 10, 6, 17, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(std::time::Duration::from_secs(3600));
        assert_eq!(clock.now(), start + ChronoDuration::hours(1));
    }

    #[tokio::test]
    async fn test_static_phase_feed() {
        let feed = StaticPhaseFeed::new(LeaguePhase::new(SeasonPhase::Pre, 0));
        assert_eq!(feed.current_phase().await.unwrap().phase, SeasonPhase::Pre);

        feed.set(LeaguePhase::new(SeasonPhase::Regular, 1));
        assert_eq!(feed.current_phase().await.unwrap().week, 1);
    }
}
