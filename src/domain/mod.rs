//! Domain Layer
//!
//! Ports the cache depends on and the league calendar value objects they
//! exchange.

pub mod ports;

pub use ports::{
    Clock, LeaguePhase, ManualClock, PhaseFeed, SeasonPhase, StaticPhaseFeed, SystemClock,
    UpstreamFetcher,
};
