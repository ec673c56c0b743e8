//! Thin shims the engine consumes from the host. Each is a small trait
//! so the demo binary and tests can supply trivial implementations
//! without pulling in wallet/RPC code.

use crate::model::Block;
use shared::Hash256;

/// Deterministic block subsidy, a function of height alone.
pub trait BlockRewardFn: Send + Sync {
    fn block_reward(&self, height: u64) -> u64;
}

/// Halving subsidy schedule: the reward halves every `halving_interval`
/// blocks until it floors at zero.
pub struct HalvingReward {
    pub initial_reward: u64,
    pub halving_interval: u64,
}

impl BlockRewardFn for HalvingReward {
    fn block_reward(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= 64 {
            0
        } else {
            self.initial_reward >> halvings
        }
    }
}

/// Resolves the effective owner of a coinbase output, identity by
/// default; hookable for contract-wrapped coinbases.
pub trait CoinbaseOwnerFn: Send + Sync {
    fn coinbase_owner(&self, pub_key: &str) -> String;
}

pub struct IdentityCoinbaseOwner;

impl CoinbaseOwnerFn for IdentityCoinbaseOwner {
    fn coinbase_owner(&self, pub_key: &str) -> String {
        pub_key.to_string()
    }
}

/// Produces the genesis block: either parsed from an existing file/bytes
/// or freshly generated with a new keypair.
pub trait GenesisSource {
    fn load_or_generate(&self) -> std::io::Result<Block>;
}

/// Reads genesis JSON from a path, falling back to a caller-supplied
/// generator (and persisting the result) if the file is absent or fails
/// to parse.
pub struct FileGenesisSource<F: Fn() -> Block> {
    pub path: std::path::PathBuf,
    pub generate: F,
}

impl<F: Fn() -> Block> GenesisSource for FileGenesisSource<F> {
    fn load_or_generate(&self) -> std::io::Result<Block> {
        match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<Block>(&bytes) {
                Ok(block) => Ok(block),
                Err(_) => self.generate_and_persist(),
            },
            Err(_) => self.generate_and_persist(),
        }
    }
}

impl<F: Fn() -> Block> FileGenesisSource<F> {
    fn generate_and_persist(&self) -> std::io::Result<Block> {
        let block = (self.generate)();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&block)?)?;
        Ok(block)
    }
}

/// A `powHash` adapter keyed by id, used when the consensus hook needs a
/// block's own id fed through the active hash function (e.g. mining).
pub trait PowHashFn: Send + Sync {
    fn pow_hash(&self, bytes: &[u8]) -> Hash256;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halving_reward_halves_on_schedule() {
        let reward = HalvingReward {
            initial_reward: 5000,
            halving_interval: 100,
        };
        assert_eq!(reward.block_reward(0), 5000);
        assert_eq!(reward.block_reward(99), 5000);
        assert_eq!(reward.block_reward(100), 2500);
        assert_eq!(reward.block_reward(200), 1250);
    }

    #[test]
    fn halving_reward_eventually_reaches_zero() {
        let reward = HalvingReward {
            initial_reward: 1,
            halving_interval: 1,
        };
        assert_eq!(reward.block_reward(64), 0);
    }

    #[test]
    fn identity_coinbase_owner_passes_through() {
        let owner = IdentityCoinbaseOwner;
        assert_eq!(owner.coinbase_owner("pub123"), "pub123");
    }
}
