//! The pluggable consensus interface.
//!
//! Modeled as a Rust trait with `Pow`/`Regtest` implementors rather than
//! a class hierarchy: the engine owns a `Box<dyn Consensus>` and calls
//! these fixed operations at well-defined points in block and
//! transaction submission. Block/transaction data crosses the boundary
//! as `serde_json::Value` so this crate never depends on `ledger-core`'s
//! concrete model types.

use serde_json::Value;
use shared::Hash256;

use crate::chain_view::ChainView;
use crate::error::ConsensusError;

/// The fields of a candidate block consensus needs to check and annotate.
/// `consensus_data` is mutated in place by `check_consensus_rules` (e.g.
/// to fill in the recomputed target and total work); nothing else about
/// the block is writable from here.
pub struct BlockHeaderView<'a> {
    pub block_id: Hash256,
    pub previous_block_id: Hash256,
    pub height: u64,
    pub timestamp: u64,
    pub consensus_data: &'a mut Value,
}

pub trait Consensus: Send + Sync {
    /// Deterministic total order between a candidate and the current tip
    /// for fork choice; `true` means `candidate` should become the new
    /// tip.
    fn is_block_better(&self, candidate_consensus_data: &Value, tip_consensus_data: &Value) -> bool;

    /// Verifies headers and may mutate `header.consensus_data`.
    fn check_consensus_rules(
        &self,
        header: &mut BlockHeaderView<'_>,
        chain: &dyn ChainView,
    ) -> Result<(), ConsensusError>;

    /// Produces initial consensus data for a block at `prev_height + 1`.
    fn generate_consensus_data(&self, prev_height: u64, chain: &dyn ChainView) -> Value;

    /// Per-transaction hook, called during `verifyTransaction`. Failure
    /// here rejects the transaction.
    fn verify_transaction(&self, _tx_json: &Value) -> Result<(), ConsensusError> {
        Ok(())
    }

    /// Per-transaction hook, called during confirmation. Logged but
    /// non-fatal on failure.
    fn confirm_transaction(&self, _tx_json: &Value) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn submit_transaction(&self, _tx_json: &Value) -> Result<(), ConsensusError> {
        Ok(())
    }

    /// Last chance to reject a block immediately before commit.
    fn submit_block(&self, _block_json: &Value) -> Result<(), ConsensusError> {
        Ok(())
    }

    /// Launches any background worker (mining, voting). No-op by default.
    fn start(&self) {}
}
