//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │            Ports: PhaseFeed │ UpstreamFetcher │ Clock            │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │            HttpLeagueClient (JSON REST, reqwest)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod http_feed;

pub use http_feed::{HttpFeedConfig, HttpLeagueClient, DEFAULT_BASE_URL};
