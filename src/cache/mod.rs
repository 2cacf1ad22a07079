//! Adaptive Two-Tier Cache
//!
//! Season-aware caching for league data: an in-process tier in front of an
//! optional distributed tier, with TTLs chosen from the league calendar.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Manager                                  │
//! │        (periodic tasks, health, metrics, optimize, emergency reset)       │
//! ├───────────────────────┬──────────────────────┬───────────────────────────┤
//! │  Cache Warmer         │  Invalidation Engine │  TTL Policy Engine        │
//! │  (priority ordered,   │  (trigger -> rules,  │  (phase + game/waiver     │
//! │   bounded, timed)     │   regex sweeps)      │   windows -> TTL)         │
//! ├───────────────────────┴──────────────────────┴───────────────────────────┤
//! │                            Tiered Store                                   │
//! │  ┌────────────────────┐    ┌────────────────┐    ┌────────────────────┐  │
//! │  │ Local Tier (RAM)   │    │ Codec          │    │ Distributed Tier   │  │
//! │  │ byte-bounded, TTL  │◀──▶│ JSON + LZ4     │◀──▶│ (optional, demoted │  │
//! │  │                    │    │ >= 1 KiB       │    │  on failure)       │  │
//! │  └────────────────────┘    └────────────────┘    └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Every TTL handed out is at least 30 seconds
//! - Distributed tier failures never reach callers
//! - Producer errors propagate unchanged and nothing is cached
//! - A corrupt entry fails only the read that found it

mod backend;
mod codec;
mod entry;
mod invalidation;
mod local;
mod manager;
mod policy;
mod proptest;
mod scheduler;
mod stats;
mod store;
mod warmer;
pub mod keys;

pub use backend::{BackendStats, DistributedBackend, InMemoryBackend};
pub use codec::{Codec, CodecConfig, CodecStats, Compressor, Lz4Compressor};
pub use entry::{CacheEntry, SCHEMA_VERSION};
pub use invalidation::{
    default_rules, CheckReport, InvalidationConfig, InvalidationEngine, InvalidationPriority,
    InvalidationRule, InvalidationStats, TriggerOutcome, TRIGGER_GAME_END, TRIGGER_GAME_START,
    TRIGGER_OPTIMIZATION, TRIGGER_WAIVER_PROCESSING, TRIGGER_WEEK_CHANGE,
};
pub use local::{LocalTier, LocalTierConfig};
pub use manager::{
    CacheManager, ManagerConfig, MemoryUsage, OptimizationReport, PerformanceMetrics,
};
pub use policy::{
    default_strategies, ttl_for, CacheContext, PolicyConfig, TemporalSnapshot, TimeWindow,
    TtlPolicyEngine, TtlStrategy, DEFAULT_TTL, MIN_PHASE_REFRESH, MIN_TTL, WAIVER_CATEGORY,
};
pub use scheduler::{IntervalFn, PeriodicTask, TaskSpec, TaskStats};
pub use stats::{LatencyTracker, StoreMetrics, StoreMetricsSnapshot};
pub use store::{StoreConfig, TieredStore};
pub use warmer::{
    CacheWarmer, CycleReport, Producer, WarmerConfig, WarmingPriority, WarmingStats, WarmingTask,
};
