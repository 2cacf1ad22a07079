//! Cache Observability
//!
//! Health assessment and the Prometheus exporter.
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │ Health Assessment    │      │ Prometheus Exporter  │
//! │ (signals -> status)  │─────▶│ (/metrics gauges)    │
//! └──────────────────────┘      └──────────────────────┘
//! ```

mod exporter;
mod health;

pub use exporter::{CacheExporter, ExporterSample};
pub use health::{assess, HealthReport, HealthSignals, HealthStatus, HealthThresholds};
