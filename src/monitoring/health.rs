//! Health Assessment
//!
//! Turns the latest cache sub-signals into one of three statuses plus
//! operator recommendations. Pure: the same signals always give the same
//! report.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every signal nominal
    Healthy,
    /// Serving, with at least one non-ideal signal
    Degraded,
    /// Critical memory pressure
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    /// Numeric form for gauges: 0 healthy, 1 degraded, 2 unhealthy
    pub fn code(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Pressure thresholds and staleness limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Above this pressure: degraded
    pub memory_warning: f64,
    /// Above this pressure: unhealthy
    pub memory_critical: f64,
    pub warmer_stale_after: Duration,
    pub invalidator_stale_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 0.7,
            memory_critical: 0.9,
            warmer_stale_after: Duration::from_secs(3 * 3600),
            invalidator_stale_after: Duration::from_secs(15 * 60),
        }
    }
}

/// Raw inputs to one assessment
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSignals {
    pub now: DateTime<Utc>,
    pub backend_configured: bool,
    pub backend_available: bool,
    /// Local tier used / capacity
    pub memory_pressure: f64,
    pub compression_enabled: bool,
    /// Last warming cycle, or when maintenance started if none has run
    pub warmer_last_run: DateTime<Utc>,
    /// Last invalidation check, or when maintenance started if none has run
    pub invalidator_last_check: DateTime<Utc>,
}

/// Health snapshot `{status, details, recommendations}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: BTreeMap<String, serde_json::Value>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Assess `signals` against `thresholds`
pub fn assess(signals: &HealthSignals, thresholds: &HealthThresholds) -> HealthReport {
    let mut status = HealthStatus::Healthy;
    let mut recommendations = Vec::new();
    let mut degrade = |reason: String| {
        status = status.max(HealthStatus::Degraded);
        recommendations.push(reason);
    };

    if signals.backend_configured && !signals.backend_available {
        degrade("Distributed tier unreachable: serving from local tier only, check backend connectivity".into());
    }

    let pressure = signals.memory_pressure;
    if pressure > thresholds.memory_warning && pressure <= thresholds.memory_critical {
        degrade(format!(
            "Memory pressure at {:.0}%: consider running optimize or raising the local tier capacity",
            pressure * 100.0
        ));
    }

    if !signals.compression_enabled {
        degrade("Compression disabled: enable it to reduce memory usage".into());
    }

    let warmer_age = age(signals.now, signals.warmer_last_run);
    if warmer_age > thresholds.warmer_stale_after {
        degrade(format!(
            "Cache warming has not run for {} minutes",
            warmer_age.as_secs() / 60
        ));
    }

    let invalidator_age = age(signals.now, signals.invalidator_last_check);
    if invalidator_age > thresholds.invalidator_stale_after {
        degrade(format!(
            "Invalidation check has not run for {} minutes",
            invalidator_age.as_secs() / 60
        ));
    }

    if pressure > thresholds.memory_critical {
        status = HealthStatus::Unhealthy;
        recommendations.insert(
            0,
            format!(
                "Critical memory pressure at {:.0}%: run emergency reset or evict entries",
                pressure * 100.0
            ),
        );
    }

    let mut details = BTreeMap::new();
    details.insert(
        "backend".to_string(),
        serde_json::json!({
            "configured": signals.backend_configured,
            "available": signals.backend_available,
        }),
    );
    details.insert("memory_pressure".to_string(), serde_json::json!(pressure));
    details.insert(
        "compression_enabled".to_string(),
        serde_json::json!(signals.compression_enabled),
    );
    details.insert(
        "warmer_age_secs".to_string(),
        serde_json::json!(warmer_age.as_secs()),
    );
    details.insert(
        "invalidator_age_secs".to_string(),
        serde_json::json!(invalidator_age.as_secs()),
    );

    HealthReport {
        status,
        details,
        recommendations,
        checked_at: signals.now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nominal() -> HealthSignals {
        let now = Utc.with_ymd_and_hms(2024, 10, 6, 18, 0, 0).unwrap();
        HealthSignals {
            now,
            backend_configured: true,
            backend_available: true,
            memory_pressure: 0.2,
            compression_enabled: true,
            warmer_last_run: now,
            invalidator_last_check: now,
        }
    }

    #[test]
    fn test_nominal_is_healthy() {
        let report = assess(&nominal(), &HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_memory_pressure_bands() {
        let thresholds = HealthThresholds::default();
        for (pressure, expected) in [
            (0.70, HealthStatus::Healthy),
            (0.75, HealthStatus::Degraded),
            (0.90, HealthStatus::Degraded),
            (0.95, HealthStatus::Unhealthy),
        ] {
            let signals = HealthSignals {
                memory_pressure: pressure,
                ..nominal()
            };
            assert_eq!(assess(&signals, &thresholds).status, expected, "{}", pressure);
        }
    }

    #[test]
    fn test_single_bad_signal_degrades() {
        let thresholds = HealthThresholds::default();

        let down = HealthSignals {
            backend_available: false,
            ..nominal()
        };
        assert_eq!(assess(&down, &thresholds).status, HealthStatus::Degraded);

        let no_compression = HealthSignals {
            compression_enabled: false,
            ..nominal()
        };
        assert_eq!(assess(&no_compression, &thresholds).status, HealthStatus::Degraded);

        let stale = nominal();
        let stale = HealthSignals {
            warmer_last_run: stale.now - chrono::Duration::hours(4),
            ..stale
        };
        assert_eq!(assess(&stale, &thresholds).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_unconfigured_backend_is_fine() {
        let signals = HealthSignals {
            backend_configured: false,
            backend_available: false,
            ..nominal()
        };
        assert!(assess(&signals, &HealthThresholds::default())
            .status
            .is_healthy());
    }

    #[test]
    fn test_critical_recommendation_first() {
        let signals = HealthSignals {
            memory_pressure: 0.97,
            compression_enabled: false,
            ..nominal()
        };
        let report = assess(&signals, &HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.recommendations[0].starts_with("Critical"));
        assert_eq!(report.recommendations.len(), 2);
    }
}
