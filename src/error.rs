//! Error types for the adaptive cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the adaptive cache
///
/// Only [`Error::CorruptEntry`] and caller producer errors ever reach a
/// normal caller of the data path. Everything else is absorbed by the
/// component that hit it and reported through logs and health signals.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Cached bytes could not be decoded back into a value
    #[error("Corrupt cache entry for key {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Distributed backing store error
    #[error("Backing store error: {0}")]
    Backend(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Policy / Invalidation Errors
    // =========================================================================
    /// Invalid key pattern
    #[error("Invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// League phase feed error
    #[error("League phase feed error: {0}")]
    Feed(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Metrics registry error
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its hard timeout
    #[error("{task} timed out after {duration:?}")]
    Timeout { task: String, duration: Duration },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a corrupt-entry error for `key`
    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Error::CorruptEntry {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the stored entry is unreadable
    pub fn is_corrupt_entry(&self) -> bool {
        matches!(self, Error::CorruptEntry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corrupt("roster:1", "bad lz4 frame");
        assert_eq!(
            err.to_string(),
            "Corrupt cache entry for key roster:1: bad lz4 frame"
        );
        assert!(err.is_corrupt_entry());

        let timeout = Error::Timeout {
            task: "warming cycle".to_string(),
            duration: Duration::from_secs(15),
        };
        assert!(timeout.to_string().contains("warming cycle timed out"));
        assert!(!timeout.is_corrupt_entry());
    }

    #[test]
    fn test_pattern_error_conversion() {
        let err: Error = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, Error::InvalidPattern(_)));
    }
}
