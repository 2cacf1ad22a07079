//! Property-Based Tests for the Cache
//!
//! # Test Properties
//!
//! 1. **TTL Floor**: every computed TTL is at least 30 seconds
//! 2. **Off-Season Dominance**: off-season TTL ignores windows and weeks
//! 3. **Codec Roundtrip**: decode(envelope(compress(v))) = v, at any size
//! 4. **Key Groups**: a group is a prefix of its key

#![cfg(test)]

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use super::codec::{Codec, CodecConfig};
use super::entry::CacheEntry;
use super::keys;
use super::policy::{ttl_for, CacheContext, TemporalSnapshot, TtlStrategy, MIN_TTL};
use crate::domain::{LeaguePhase, SeasonPhase};

// =============================================================================
// Property Strategies
// =============================================================================

fn phase_strategy() -> impl Strategy<Value = Option<LeaguePhase>> {
    let phase = prop_oneof![
        Just(SeasonPhase::Pre),
        Just(SeasonPhase::Regular),
        Just(SeasonPhase::Post),
        Just(SeasonPhase::Off),
    ];
    prop::option::of((phase, 0u32..=22).prop_map(|(p, w)| LeaguePhase::new(p, w)))
}

fn strategy_strategy() -> impl Strategy<Value = TtlStrategy> {
    (
        1u64..200_000,
        1u64..200_000,
        1u64..200_000,
        prop::option::of(1u64..200_000),
    )
        .prop_map(|(base, game, off, waiver)| {
            let strategy = TtlStrategy::new(base, game, off);
            match waiver {
                Some(w) => strategy.with_waiver(w),
                None => strategy,
            }
        })
}

fn snapshot_strategy() -> impl Strategy<Value = TemporalSnapshot> {
    (phase_strategy(), any::<bool>(), any::<bool>()).prop_map(|(phase, game_time, waiver_window)| {
        TemporalSnapshot {
            now: Utc.with_ymd_and_hms(2024, 10, 6, 18, 0, 0).unwrap(),
            phase,
            game_time,
            waiver_window,
        }
    })
}

// =============================================================================
// TTL Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_ttl_never_below_floor(
        strategy in strategy_strategy(),
        snapshot in snapshot_strategy(),
        week in prop::option::of(0u32..=22),
    ) {
        let mut context = CacheContext::new("matchup");
        context.entity_week = week;
        let ttl = ttl_for("matchup", &strategy, &context, &snapshot);
        prop_assert!(ttl >= MIN_TTL);
    }

    #[test]
    fn prop_off_season_dominates(
        strategy in strategy_strategy(),
        snapshot in snapshot_strategy(),
        week in 0u32..=22,
    ) {
        let snapshot = TemporalSnapshot {
            phase: Some(LeaguePhase::new(SeasonPhase::Off, week)),
            ..snapshot
        };
        let context = CacheContext::new("league").with_week(week);
        let ttl = ttl_for("league", &strategy, &context, &snapshot);
        prop_assert_eq!(ttl, strategy.off_season_ttl.max(MIN_TTL));
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_codec_roundtrip(words in prop::collection::vec("[a-z]{1,12}", 0..600)) {
        let codec = Codec::new(CodecConfig::default());
        let entry = codec.compress(&words).unwrap();
        let restored = CacheEntry::from_bytes("players:nfl", entry.to_bytes()).unwrap();
        let decoded: Vec<String> = codec.decode("players:nfl", &restored).unwrap();
        prop_assert_eq!(decoded, words);
    }

    #[test]
    fn prop_group_is_key_prefix(key in "[a-z]{1,8}(:[a-z0-9]{1,6}){0,3}") {
        let group = keys::group(&key);
        prop_assert!(key.starts_with(&group));
        prop_assert!(group.matches(':').count() <= 1);
    }
}
