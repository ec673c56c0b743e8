//! Deterministic consensus for tests: fork choice is driven by an
//! explicit `isBetter` boolean field instead of recomputed
//! proof-of-work, so fork-choice scenarios don't depend on actually
//! mining a winning hash.

use serde_json::{json, Value};

use crate::chain_view::ChainView;
use crate::consensus::{BlockHeaderView, Consensus};
use crate::error::ConsensusError;

pub struct Regtest;

impl Consensus for Regtest {
    fn is_block_better(&self, candidate_consensus_data: &Value, _tip_consensus_data: &Value) -> bool {
        candidate_consensus_data
            .get("isBetter")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn check_consensus_rules(
        &self,
        _header: &mut BlockHeaderView<'_>,
        _chain: &dyn ChainView,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn generate_consensus_data(&self, _prev_height: u64, _chain: &dyn ChainView) -> Value {
        json!({"isBetter": false})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_block_better_reads_explicit_flag() {
        let regtest = Regtest;
        assert!(regtest.is_block_better(&json!({"isBetter": true}), &json!({})));
        assert!(!regtest.is_block_better(&json!({"isBetter": false}), &json!({})));
        assert!(!regtest.is_block_better(&json!({}), &json!({})));
    }
}
