//! Arbitrary-precision unsigned integer arithmetic over hex strings.
//!
//! Values are exchanged as
//! lowercase hex strings (an empty string is treated as zero), and the
//! canonical textual form used for proof-of-work target/total-work
//! comparisons is a fixed-width 64 hex digit string so that lexicographic
//! and numeric ordering agree.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::BlockchainError;

/// Width, in hex digits, of the canonical fixed-width representation used
/// for target/total-work comparisons (256 bits).
pub const FIXED_HEX_WIDTH: usize = 64;

/// An arbitrary-precision unsigned integer, backed by `num_bigint::BigUint`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HexNum(BigUint);

impl HexNum {
    #[must_use]
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// An empty string is zero, and a leading `0x`/`0X` prefix is
    /// tolerated but not required.
    pub fn from_hex(s: &str) -> Result<Self, BlockchainError> {
        let trimmed = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Self::zero());
        }
        BigUint::parse_bytes(trimmed.as_bytes(), 16)
            .map(Self)
            .ok_or_else(|| BlockchainError::InvalidHexNumber(s.to_string()))
    }

    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value))
    }

    /// Lowercase hex, no padding, `"0"` for zero.
    #[must_use]
    pub fn to_hex(&self) -> String {
        if self.0.is_zero() {
            return "0".to_string();
        }
        self.0.to_str_radix(16)
    }

    /// Lowercase hex, left-padded with zeros to `FIXED_HEX_WIDTH` digits.
    ///
    /// Used wherever two `HexNum`s need to be compared as plain strings
    /// (e.g. when persisted as table keys) without losing numeric
    /// ordering; values wider than the fixed width are returned unpadded
    /// rather than silently truncated.
    #[must_use]
    pub fn to_fixed_hex(&self) -> String {
        let raw = self.to_hex();
        if raw.len() >= FIXED_HEX_WIDTH {
            raw
        } else {
            format!("{}{}", "0".repeat(FIXED_HEX_WIDTH - raw.len()), raw)
        }
    }

    #[must_use]
    pub fn checked_add(&self, other: &Self) -> Self {
        Self(&self.0 + &other.0)
    }

    /// Saturating subtraction: an underflow is zero rather than wrapping
    /// or erroring.
    #[must_use]
    pub fn saturating_sub(&self, other: &Self) -> Self {
        if self.0 >= other.0 {
            Self(&self.0 - &other.0)
        } else {
            Self::zero()
        }
    }

    #[must_use]
    pub fn checked_mul(&self, other: &Self) -> Self {
        Self(&self.0 * &other.0)
    }

    /// Integer division; returns zero on division by zero rather than
    /// panicking.
    #[must_use]
    pub fn checked_div(&self, other: &Self) -> Self {
        if other.0.is_zero() {
            Self::zero()
        } else {
            Self(&self.0 / &other.0)
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Lossy conversion to `f64`, used only for diagnostics (e.g. estimated
    /// hashrate / difficulty-ratio logging), never for consensus decisions.
    #[must_use]
    pub fn to_f64_lossy(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::INFINITY)
    }
}

impl fmt::Display for HexNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for HexNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexNum({})", self.to_hex())
    }
}

impl FromStr for HexNum {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<crate::Hash256> for HexNum {
    fn from(hash: crate::Hash256) -> Self {
        Self(BigUint::from_bytes_be(hash.as_bytes()))
    }
}

impl PartialOrd<u64> for HexNum {
    fn partial_cmp(&self, other: &u64) -> Option<Ordering> {
        self.0.partial_cmp(&BigUint::from(*other))
    }
}

impl PartialEq<u64> for HexNum {
    fn eq(&self, other: &u64) -> bool {
        self.0 == BigUint::from(*other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_parses_as_zero() {
        assert_eq!(HexNum::from_hex("").unwrap(), HexNum::zero());
    }

    #[test]
    fn round_trips_through_hex() {
        let n = HexNum::from_hex("ffaa").unwrap();
        assert_eq!(n.to_hex(), "ffaa");
    }

    #[test]
    fn fixed_hex_is_left_padded_to_64_digits() {
        let n = HexNum::from_hex("1").unwrap();
        let fixed = n.to_fixed_hex();
        assert_eq!(fixed.len(), 64);
        assert!(fixed.ends_with('1'));
        assert!(fixed.starts_with(&"0".repeat(63)));
    }

    #[test]
    fn addition_matches_expected_sum() {
        let a = HexNum::from_hex("a").unwrap();
        let b = HexNum::from_hex("5").unwrap();
        assert_eq!(a.checked_add(&b), HexNum::from_hex("f").unwrap());
    }

    #[test]
    fn subtraction_saturates_at_zero() {
        let a = HexNum::from_hex("5").unwrap();
        let b = HexNum::from_hex("a").unwrap();
        assert_eq!(a.saturating_sub(&b), HexNum::zero());
    }

    #[test]
    fn division_by_zero_returns_zero() {
        let a = HexNum::from_hex("10").unwrap();
        assert_eq!(a.checked_div(&HexNum::zero()), HexNum::zero());
    }

    #[test]
    fn ordering_is_numeric_not_lexicographic_on_raw_hex() {
        let small = HexNum::from_hex("9").unwrap();
        let big = HexNum::from_hex("10").unwrap();
        assert!(small < big);
    }

    #[test]
    fn fixed_hex_preserves_numeric_ordering_as_string_ordering() {
        let small = HexNum::from_hex("9").unwrap().to_fixed_hex();
        let big = HexNum::from_hex("10").unwrap().to_fixed_hex();
        assert!(small < big);
    }

    #[test]
    fn hash_converts_into_hexnum() {
        let hash = crate::Hash256::sha256(b"target");
        let n: HexNum = hash.into();
        assert!(!n.is_zero());
    }

    #[test]
    fn rejects_invalid_hex() {
        assert!(HexNum::from_hex("not-hex").is_err());
    }
}
