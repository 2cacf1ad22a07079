//! Adaptive Cache - Season-Aware Caching for League Data
//!
//! A two-tier cache (in-process plus optional distributed store) whose TTLs
//! follow the league calendar: short during games, long in the off-season,
//! shorter still for the current week's data.
//!
//! # Architecture
//!
//! ```text
//! Phase Feed ──▶ TTL Policy ──▶ Tiered Store ◀── Warmer
//!                                    ▲
//!                         Invalidation Engine
//!                                    ▲
//!                              Cache Manager
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - HTTP implementation of the league data ports
//! - [`cache`] - Codec, tiers, policy, invalidation, warming and manager
//! - [`config`] - YAML settings for every component
//! - [`domain`] - Ports and league calendar value objects
//! - [`error`] - Error types
//! - [`monitoring`] - Health assessment and Prometheus exporter

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{
    CacheContext, CacheManager, CacheWarmer, Codec, InMemoryBackend, InvalidationEngine,
    LocalTier, TieredStore, TtlPolicyEngine,
};
pub use config::CacheSettings;
pub use domain::{LeaguePhase, SeasonPhase};
pub use error::{Error, Result};
pub use monitoring::{HealthReport, HealthStatus};
