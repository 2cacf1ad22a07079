//! Cache Entry Types
//!
//! A [`CacheEntry`] is the codec's output: the serialized (and possibly
//! compressed) value plus enough metadata to read it back. The same entry is
//! stored in the local tier as-is and shipped to the distributed tier through
//! a small binary envelope.
//!
//! # Envelope layout
//!
//! ```text
//! ┌───────┬─────────┬───────┬───────────────┬──────────────┬────────┬─────────┬─────────┐
//! │ "AC"  │ version │ flags │ original_size │ stored_at ms │ sv len │ schema  │ payload │
//! │ 2B    │ 1B      │ 1B    │ u32 LE        │ i64 LE       │ 1B     │ sv len  │ rest    │
//! └───────┴─────────┴───────┴───────────────┴──────────────┴────────┴─────────┴─────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Schema version stamped on every entry written by this build
pub const SCHEMA_VERSION: &str = "1";

const ENVELOPE_MAGIC: &[u8; 2] = b"AC";
const ENVELOPE_VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const HEADER_LEN: usize = 2 + 1 + 1 + 4 + 8 + 1;

/// A stored value.
///
/// `compressed == true` always comes with a `compressed_size`; such payloads
/// are only readable through [`super::Codec::decompress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    payload: Bytes,
    compressed: bool,
    original_size: usize,
    compressed_size: Option<usize>,
    stored_at: DateTime<Utc>,
    schema_version: String,
}

impl CacheEntry {
    /// Entry holding the plain serialized value
    pub fn plain(payload: Bytes) -> Self {
        Self {
            original_size: payload.len(),
            payload,
            compressed: false,
            compressed_size: None,
            stored_at: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Entry holding a compressed payload of a value `original_size` bytes long
    pub fn compressed(payload: Bytes, original_size: usize) -> Self {
        Self {
            compressed_size: Some(payload.len()),
            payload,
            compressed: true,
            original_size,
            stored_at: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Override the storage timestamp
    pub fn with_stored_at(mut self, stored_at: DateTime<Utc>) -> Self {
        self.stored_at = stored_at;
        self
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Serialized size before compression
    #[inline]
    pub fn original_size(&self) -> usize {
        self.original_size
    }

    #[inline]
    pub fn compressed_size(&self) -> Option<usize> {
        self.compressed_size
    }

    #[inline]
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    #[inline]
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Bytes this entry occupies in memory
    #[inline]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Encode into the distributed-tier envelope
    pub fn to_bytes(&self) -> Bytes {
        let schema = self.schema_version.as_bytes();
        let schema_len = schema.len().min(u8::MAX as usize);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + schema_len + self.payload.len());
        buf.put_slice(ENVELOPE_MAGIC);
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        buf.put_u32_le(self.original_size as u32);
        buf.put_i64_le(self.stored_at.timestamp_millis());
        buf.put_u8(schema_len as u8);
        buf.put_slice(&schema[..schema_len]);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode an envelope read back from the distributed tier for `key`
    pub fn from_bytes(key: &str, mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::corrupt(key, "envelope shorter than header"));
        }
        if &data[..2] != ENVELOPE_MAGIC {
            return Err(Error::corrupt(key, "bad envelope magic"));
        }
        data.advance(2);

        let version = data.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(Error::corrupt(
                key,
                format!("unsupported envelope version {}", version),
            ));
        }

        let flags = data.get_u8();
        let original_size = data.get_u32_le() as usize;
        let stored_at_ms = data.get_i64_le();
        let schema_len = data.get_u8() as usize;
        if data.len() < schema_len {
            return Err(Error::corrupt(key, "truncated schema version"));
        }
        let schema_version = String::from_utf8(data.split_to(schema_len).to_vec())
            .map_err(|e| Error::corrupt(key, e))?;
        let stored_at = Utc
            .timestamp_millis_opt(stored_at_ms)
            .single()
            .ok_or_else(|| Error::corrupt(key, "invalid storage timestamp"))?;

        let compressed = flags & FLAG_COMPRESSED != 0;
        Ok(Self {
            compressed_size: compressed.then(|| data.len()),
            payload: data,
            compressed,
            original_size,
            stored_at,
            schema_version,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_entry_invariants() {
        let entry = CacheEntry::plain(Bytes::from_static(b"{\"week\":10}"));
        assert!(!entry.is_compressed());
        assert_eq!(entry.compressed_size(), None);
        assert_eq!(entry.original_size(), entry.size());
        assert_eq!(entry.schema_version(), SCHEMA_VERSION);
    }

    #[test]
    fn test_compressed_entry_invariants() {
        let entry = CacheEntry::compressed(Bytes::from_static(b"xyz"), 4096);
        assert!(entry.is_compressed());
        assert_eq!(entry.compressed_size(), Some(3));
        assert_eq!(entry.original_size(), 4096);
    }

    #[test]
    fn test_envelope_preserves_metadata() {
        let stored_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let entry =
            CacheEntry::compressed(Bytes::from_static(b"lz4-bytes"), 2048).with_stored_at(stored_at);

        let decoded = CacheEntry::from_bytes("k", entry.to_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        let err = CacheEntry::from_bytes("roster:1", Bytes::from_static(b"nope")).unwrap_err();
        assert!(err.is_corrupt_entry());

        let mut bad = BytesMut::from(&CacheEntry::plain(Bytes::from_static(b"1")).to_bytes()[..]);
        bad[0] = b'X';
        let err = CacheEntry::from_bytes("roster:1", bad.freeze()).unwrap_err();
        assert!(err.to_string().contains("roster:1"));
    }
}
