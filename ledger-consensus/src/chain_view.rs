//! A read-only, backward-scanning view of committed block headers.
//!
//! Consensus implementations (in particular the KGW retargeter, which
//! scans up to 4032 blocks back) need history but must never reach back
//! into `ledger-core`'s storage types directly — that would create a
//! dependency cycle between the two crates. The engine instead adapts its
//! own snapshot to this trait before calling into consensus.

use serde_json::Value;

/// The subset of a committed block's header consensus cares about.
#[derive(Debug, Clone)]
pub struct ConsensusHeader {
    pub height: u64,
    pub timestamp: u64,
    pub consensus_data: Value,
}

pub trait ChainView {
    /// Height of the current tip, or `0` if the chain has no blocks yet.
    fn tip_height(&self) -> u64;

    /// Header at `height`, main-chain only.
    fn header_at_height(&self, height: u64) -> Option<ConsensusHeader>;
}

/// A `ChainView` with no history, useful for tests exercising
/// retargeting at height zero.
pub struct EmptyChainView;

impl ChainView for EmptyChainView {
    fn tip_height(&self) -> u64 {
        0
    }

    fn header_at_height(&self, _height: u64) -> Option<ConsensusHeader> {
        None
    }
}

/// An in-memory `ChainView` over explicit headers, used throughout this
/// crate's own tests.
pub struct VecChainView(pub Vec<ConsensusHeader>);

impl ChainView for VecChainView {
    fn tip_height(&self) -> u64 {
        self.0.last().map_or(0, |h| h.height)
    }

    fn header_at_height(&self, height: u64) -> Option<ConsensusHeader> {
        self.0.iter().find(|h| h.height == height).cloned()
    }
}
