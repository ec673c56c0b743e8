//! Pluggable proof-of-work hash functions. `Pow<H>` is generic over this
//! trait so the KGW retargeting logic is shared between hash choices.

use blake2::{Blake2s256, Digest as _};
use shared::Hash256;

pub trait PowHash: Send + Sync {
    /// Must be uniform over the 256-bit space given random inputs.
    fn hash(data: &[u8]) -> Hash256
    where
        Self: Sized;
}

/// Double SHA-256, the default hash.
pub struct DoubleSha256;

impl PowHash for DoubleSha256 {
    fn hash(data: &[u8]) -> Hash256 {
        let once = Hash256::sha256(data);
        Hash256::sha256(once.as_bytes())
    }
}

/// A pluggable "heavier" alternative hash with the same uniform-output
/// property `PowHash` requires, for chains that want a memory-hard
/// mining function instead of double SHA-256.
pub struct Blake2sPow;

impl PowHash for Blake2sPow {
    fn hash(data: &[u8]) -> Hash256 {
        let mut hasher = Blake2s256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Hash256::from_bytes(bytes)
    }
}
