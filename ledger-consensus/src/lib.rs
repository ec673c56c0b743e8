pub mod chain_view;
pub mod consensus;
pub mod error;
pub mod hash;
pub mod pow;
pub mod regtest;

pub use chain_view::{ChainView, ConsensusHeader, EmptyChainView, VecChainView};
pub use consensus::{BlockHeaderView, Consensus};
pub use error::ConsensusError;
pub use hash::{Blake2sPow, DoubleSha256, PowHash};
pub use pow::Pow;
pub use regtest::Regtest;
