//! Versioned value encoding
//!
//! Layout: `[version] || json(value)`. The leading byte lets a newer build
//! recognise records written under an older layout and treat them as
//! absent instead of misreading them.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Layout version written by this build
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty record")]
    Empty,

    #[error("Format version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u8, expected: u8 },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    version: u8,
}

impl Codec {
    pub const fn new(version: u8) -> Self {
        Self { version }
    }

    pub const fn current() -> Self {
        Self::new(FORMAT_VERSION)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(64);
        out.push(self.version);
        serde_json::to_writer(&mut out, value)?;
        Ok(out)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        let (&found, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
        if found != self.version {
            return Err(DecodeError::VersionMismatch {
                found,
                expected: self.version,
            });
        }
        // serde_json messages carry positions, not payload content
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::current()
    }
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    Codec::current().encode(value)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    Codec::current().decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PerfCounters {
        total_response_ms: u64,
        response_count: u32,
        last_model: Option<String>,
    }

    #[test]
    fn test_leading_version_byte() {
        let bytes = encode("english").unwrap();
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(&bytes[1..], b"\"english\"");
    }

    #[test]
    fn test_struct_roundtrip() {
        let counters = PerfCounters {
            total_response_ms: 1234,
            response_count: 7,
            last_model: Some("gemma-3n".to_string()),
        };
        let bytes = encode(&counters).unwrap();
        assert_eq!(decode::<PerfCounters>(&bytes).unwrap(), counters);
    }

    #[test]
    fn test_version_mismatch() {
        let old = Codec::new(3).encode(&42u32).unwrap();
        assert_eq!(
            Codec::new(4).decode::<u32>(&old),
            Err(DecodeError::VersionMismatch { found: 3, expected: 4 })
        );
    }

    #[test]
    fn test_empty_and_malformed() {
        assert_eq!(decode::<u32>(&[]), Err(DecodeError::Empty));
        assert!(matches!(
            decode::<u32>(&[FORMAT_VERSION, b'{']),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_type_mismatch_is_malformed() {
        let bytes = encode("not a number").unwrap();
        assert!(matches!(decode::<u64>(&bytes), Err(DecodeError::Malformed(_))));
    }
}
