//! Compression Codec
//!
//! Serializes values to JSON and LZ4-compresses anything at or above a size
//! threshold. Compression failures never escape: the value is stored
//! uncompressed and a warning is logged. Decompression failures do escape,
//! as [`Error::CorruptEntry`], because the entry is unreadable.
//!
//! # Example
//!
//! ```
//! use adaptive_cache::cache::{Codec, CodecConfig};
//!
//! let codec = Codec::new(CodecConfig::default());
//!
//! let value = vec!["player"; 500];
//! let entry = codec.compress(&value).unwrap();
//! assert!(entry.is_compressed());
//!
//! let back: Vec<String> = codec.decompress("players:nfl", entry.payload(), true).unwrap();
//! assert_eq!(back.len(), 500);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::entry::CacheEntry;
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the codec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Whether compression starts enabled
    pub enabled: bool,
    /// Serialized values at or above this size are compressed
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Algorithm name for logs and errors
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compressor with a prepended size header
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self { level: 4 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Point-in-time codec counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CodecStats {
    pub enabled: bool,
    /// Entries written compressed
    pub compressed_entries: u64,
    /// Entries written uncompressed
    pub plain_entries: u64,
    /// Compression attempts that failed and fell back
    pub fallbacks: u64,
    /// Original bytes of compressed entries
    pub original_bytes: u64,
    /// Stored bytes of compressed entries
    pub compressed_bytes: u64,
}

impl CodecStats {
    /// Stored / original size across compressed entries (1.0 when none)
    pub fn compression_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f64 / self.original_bytes as f64
        }
    }
}

/// Serialize/compress boundary between typed values and stored bytes
pub struct Codec {
    config: CodecConfig,
    enabled: AtomicBool,
    compressor: Box<dyn Compressor>,
    compressed_entries: AtomicU64,
    plain_entries: AtomicU64,
    fallbacks: AtomicU64,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        let compressor = Box::new(Lz4Compressor::with_level(config.level));
        Self::with_compressor(config, compressor)
    }

    /// Create with a custom compressor implementation
    pub fn with_compressor(config: CodecConfig, compressor: Box<dyn Compressor>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            compressor,
            compressed_entries: AtomicU64::new(0),
            plain_entries: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            original_bytes: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::Relaxed);
        if was != enabled {
            debug!(enabled, "Compression toggled");
        }
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold_bytes
    }

    /// Serialize `value` and compress it when large enough.
    ///
    /// Only serialization can fail; compression problems fall back to the
    /// plain form.
    pub fn compress<T: Serialize + ?Sized>(&self, value: &T) -> Result<CacheEntry> {
        let serialized = serde_json::to_vec(value)?;

        if serialized.len() < self.config.threshold_bytes || !self.is_enabled() {
            return Ok(self.plain(serialized));
        }

        match self.compressor.compress(&serialized) {
            Ok(compressed) if compressed.len() < serialized.len() => {
                self.compressed_entries.fetch_add(1, Ordering::Relaxed);
                self.original_bytes
                    .fetch_add(serialized.len() as u64, Ordering::Relaxed);
                self.compressed_bytes
                    .fetch_add(compressed.len() as u64, Ordering::Relaxed);
                Ok(CacheEntry::compressed(
                    Bytes::from(compressed),
                    serialized.len(),
                ))
            }
            // Incompressible input: keep the smaller plain form
            Ok(_) => Ok(self.plain(serialized)),
            Err(e) => {
                warn!(
                    "Compression with {} failed, storing uncompressed: {}",
                    self.compressor.name(),
                    e
                );
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                Ok(self.plain(serialized))
            }
        }
    }

    /// Inverse of [`Codec::compress`] for the entry stored under `key`
    pub fn decompress<T: DeserializeOwned>(
        &self,
        key: &str,
        payload: &[u8],
        was_compressed: bool,
    ) -> Result<T> {
        if was_compressed {
            let raw = self
                .compressor
                .decompress(payload)
                .map_err(|e| Error::corrupt(key, e))?;
            serde_json::from_slice(&raw).map_err(|e| Error::corrupt(key, e))
        } else {
            serde_json::from_slice(payload).map_err(|e| Error::corrupt(key, e))
        }
    }

    /// Decode a whole entry
    pub fn decode<T: DeserializeOwned>(&self, key: &str, entry: &CacheEntry) -> Result<T> {
        self.decompress(key, entry.payload(), entry.is_compressed())
    }

    pub fn stats(&self) -> CodecStats {
        CodecStats {
            enabled: self.is_enabled(),
            compressed_entries: self.compressed_entries.load(Ordering::Relaxed),
            plain_entries: self.plain_entries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            original_bytes: self.original_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
        }
    }

    fn plain(&self, serialized: Vec<u8>) -> CacheEntry {
        self.plain_entries.fetch_add(1, Ordering::Relaxed);
        CacheEntry::plain(Bytes::from(serialized))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingCompressor;

    impl Compressor for FailingCompressor {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn compress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::CompressionFailed {
                algorithm: "failing".into(),
                reason: "out of memory".into(),
            })
        }

        fn decompress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::DecompressionFailed {
                algorithm: "failing".into(),
                reason: "bad frame".into(),
            })
        }
    }

    fn large_value() -> serde_json::Value {
        let players: Vec<_> = (0..200)
            .map(|i| json!({"player_id": i.to_string(), "position": "WR", "team": "KC"}))
            .collect();
        json!({ "players": players })
    }

    #[test]
    fn test_small_values_stay_plain() {
        let codec = Codec::default();
        let entry = codec.compress(&json!({"week": 10})).unwrap();
        assert!(!entry.is_compressed());

        let back: serde_json::Value = codec.decode("state:nfl", &entry).unwrap();
        assert_eq!(back, json!({"week": 10}));
    }

    #[test]
    fn test_large_values_compress() {
        let codec = Codec::default();
        let value = large_value();
        let entry = codec.compress(&value).unwrap();

        assert!(entry.is_compressed());
        assert!(entry.compressed_size().unwrap() < entry.original_size());
        let back: serde_json::Value = codec.decode("players:nfl", &entry).unwrap();
        assert_eq!(back, value);

        let stats = codec.stats();
        assert_eq!(stats.compressed_entries, 1);
        assert!(stats.compression_ratio() < 1.0);
    }

    #[test]
    fn test_disabled_codec_never_compresses() {
        let codec = Codec::new(CodecConfig {
            enabled: false,
            ..Default::default()
        });
        let entry = codec.compress(&large_value()).unwrap();
        assert!(!entry.is_compressed());

        codec.set_enabled(true);
        assert!(codec.compress(&large_value()).unwrap().is_compressed());
    }

    #[test]
    fn test_compression_failure_falls_back() {
        let codec = Codec::with_compressor(CodecConfig::default(), Box::new(FailingCompressor));
        let value = large_value();

        let entry = codec.compress(&value).unwrap();
        assert!(!entry.is_compressed());
        assert_eq!(codec.stats().fallbacks, 1);

        let back: serde_json::Value = codec.decode("players:nfl", &entry).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_decompression_failure_is_corrupt_entry() {
        let codec = Codec::default();
        let err = codec
            .decompress::<serde_json::Value>("matchup:1:3", b"definitely not lz4", true)
            .unwrap_err();
        assert_matches::assert_matches!(err, Error::CorruptEntry { ref key, .. } if key == "matchup:1:3");
    }

    #[test]
    fn test_threshold_boundary() {
        let codec = Codec::new(CodecConfig {
            threshold_bytes: 64,
            ..Default::default()
        });
        // 64 bytes of serialized JSON: a quoted string of 62 repeated chars
        let at_threshold = "a".repeat(62);
        assert!(codec.compress(&at_threshold).unwrap().is_compressed());

        let below = "a".repeat(61);
        assert!(!codec.compress(&below).unwrap().is_compressed());
    }
}
