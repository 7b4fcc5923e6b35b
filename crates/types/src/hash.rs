//! 32-byte content hash.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error parsing a hash from its hex representation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    /// The input was not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    /// The decoded input was not exactly 32 bytes.
    #[error("expected 32 bytes, got {0}")]
    WrongLength(usize),
}

/// A 32-byte blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash, used as the parent of the genesis block.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Hash(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap raw digest bytes without hashing.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a hex string (with or without a `0x` prefix).
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(HexError::WrongLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }

    /// Check for the all-zero hash.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}{:02x}…", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(Hash::from_bytes(b"trellis"), Hash::from_bytes(b"trellis"));
        assert_ne!(Hash::from_bytes(b"a"), Hash::from_bytes(b"b"));
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash::from_bytes(b"round trip");
        let parsed = Hash::from_hex(&h.to_string()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(Hash::from_hex("zz"), Err(HexError::InvalidHex(_))));
        assert!(matches!(Hash::from_hex("abcd"), Err(HexError::WrongLength(2))));
    }
}
