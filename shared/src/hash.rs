use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::BlockchainError;

/// 256-bit digest used to identify blocks, transactions, outputs and inputs.
///
/// Every content-addressable object in the ledger is identified by the
/// SHA-256 digest of its canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// Creates a zeroed hash
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Creates a hash from a 32-byte array
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the hash
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the SHA-256 hash of the provided data
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// SHA-256 over the concatenation of several byte slices without an
    /// intermediate allocation — used by the many `H(a || b)` style ids in
    /// the data model (output commitments, aggregate signature messages).
    #[must_use]
    pub fn sha256_concat(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Checks if the hash satisfies the specified difficulty
    /// (number of leading zero bits)
    #[must_use]
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_zeros() >= difficulty
    }

    /// Counts the number of leading zero bits in the hash
    #[must_use]
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| BlockchainError::InvalidHash(format!("not valid hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(BlockchainError::InvalidHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

impl TryFrom<String> for Hash256 {
    type Error = BlockchainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Hash256> for String {
    fn from(hash: Hash256) -> Self {
        hash.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_creation_and_display() {
        let hash = Hash256::zero();
        assert_eq!(hash.to_string(), "0".repeat(64));
    }

    #[test]
    fn test_sha256_hashing() {
        let data = b"hello world";
        let hash = Hash256::sha256(data);
        assert_ne!(hash, Hash256::zero());
    }

    #[test]
    fn test_sha256_concat_matches_manual_concatenation() {
        let a = Hash256::sha256_concat(&[b"foo", b"bar"]);
        let b = Hash256::sha256(b"foobar");
        assert_eq!(a, b);
    }

    #[test]
    fn test_difficulty_check() {
        let easy_hash = Hash256::from_bytes([
            0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0,
        ]);
        assert!(easy_hash.meets_difficulty(20));
        assert!(!easy_hash.meets_difficulty(40));
    }

    #[test]
    fn test_leading_zeros_count() {
        let hash = Hash256::from_bytes([
            0, 0, 0, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0,
        ]);
        assert_eq!(hash.leading_zeros(), 24);
    }

    #[test]
    fn test_round_trip_through_hex() {
        let hash = Hash256::sha256(b"round trip");
        let parsed: Hash256 = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!("not-hex".parse::<Hash256>().is_err());
        assert!("ab".parse::<Hash256>().is_err());
    }
}
