//! Cache Configuration
//!
//! One serde document for every component, loadable from YAML. Durations
//! are written as whole seconds.
//!
//! ```yaml
//! local:
//!   max_bytes: 104857600
//! policy:
//!   utc_offset_hours: -5
//!   strategies:
//!     matchup: { base_ttl: 3600, game_time_ttl: 30, off_season_ttl: 86400 }
//! warmer:
//!   tracked_leagues: ["784512"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::adapters::http_feed::HttpFeedConfig;
use crate::cache::{
    CodecConfig, InvalidationConfig, LocalTierConfig, ManagerConfig, PolicyConfig, StoreConfig,
    WarmerConfig,
};
use crate::error::{Error, Result};

/// `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Option<Duration>` as whole seconds or null
pub mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Settings for the whole subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub codec: CodecConfig,
    pub local: LocalTierConfig,
    pub store: StoreConfig,
    pub policy: PolicyConfig,
    pub invalidation: InvalidationConfig,
    pub warmer: WarmerConfig,
    pub manager: ManagerConfig,
    pub feed: HttpFeedConfig,
}

impl CacheSettings {
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if self.local.max_bytes == 0 || self.local.max_entries == 0 {
            return Err(Error::Config("local tier capacity must be positive".into()));
        }
        if !(1..=12).contains(&self.codec.level) {
            return Err(Error::Config(format!(
                "compression level {} out of range 1-12",
                self.codec.level
            )));
        }
        if self.warmer.max_concurrent == 0 || self.warmer.league_max_concurrent == 0 {
            return Err(Error::Config("warmer concurrency must be positive".into()));
        }
        if self.invalidation.check_interval.is_zero() {
            return Err(Error::Config("invalidation check interval must be positive".into()));
        }

        let m = &self.manager;
        if !(0.0..=1.0).contains(&m.memory_warning)
            || !(0.0..=1.0).contains(&m.memory_critical)
            || m.memory_warning >= m.memory_critical
        {
            return Err(Error::Config(format!(
                "memory thresholds must satisfy 0 <= warning ({}) < critical ({}) <= 1",
                m.memory_warning, m.memory_critical
            )));
        }
        if m.optimize_target_ratio > m.optimize_memory_threshold {
            return Err(Error::Config(
                "optimize target ratio exceeds its trigger threshold".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_defaults_validate() {
        let settings = CacheSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.warmer.max_concurrent, 3);
        assert_eq!(settings.policy.utc_offset_hours, -5);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
local:
  max_bytes: 2048
policy:
  utc_offset_hours: 0
  strategies:
    matchup:
      base_ttl: 1800
      game_time_ttl: 30
      off_season_ttl: 86400
invalidation:
  check_interval: 120
warmer:
  tracked_leagues: ["784512"]
"#;
        let settings = CacheSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.local.max_bytes, 2048);
        assert_eq!(settings.local.max_entries, 100_000);
        assert_eq!(settings.invalidation.check_interval, Duration::from_secs(120));
        assert_eq!(settings.warmer.tracked_leagues, vec!["784512".to_string()]);

        let matchup = &settings.policy.strategies["matchup"];
        assert_eq!(matchup.game_time_ttl, Duration::from_secs(30));
        assert_eq!(matchup.waiver_time_ttl, None);
    }

    #[test]
    fn test_invalid_settings() {
        assert_matches!(
            CacheSettings::from_yaml_str("policy:\n  utc_offset_hours: 20\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheSettings::from_yaml_str("manager:\n  memory_warning: 0.95\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheSettings::from_yaml_str("local: [1, 2]"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            CacheSettings::from_file("/nonexistent/adaptive-cache.yaml"),
            Err(Error::Io(_))
        );
    }
}
