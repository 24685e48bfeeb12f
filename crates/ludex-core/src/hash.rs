//! BLAKE3 hashing for catalog content and manifests.
//!
//! - A game's `content_hash` is BLAKE3 over its canonical attribute bytes.
//! - The library manifest hash is BLAKE3 over the sorted per-game hashes.
//! - Reference-list ETags are BLAKE3 over the serialized response body.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Length of a BLAKE3 hash output in bytes (256 bits).
pub const HASH_LEN: usize = 32;

/// A BLAKE3 digest (32 bytes). Stored and transmitted as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Compute the BLAKE3 hash of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        let h = blake3::hash(data);
        Self(*h.as_bytes())
    }

    /// Create a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character lowercase/uppercase hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        if !s.is_ascii() || s.len() != HASH_LEN * 2 {
            return Err(Error::InvalidHash(format!(
                "expected {} hex chars, got {:?}",
                HASH_LEN * 2,
                s
            )));
        }
        let mut bytes = [0u8; HASH_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidHash(format!("non-hex pair {pair:?}")))?;
        }
        Ok(Self(bytes))
    }

    /// Get the raw bytes of this hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
