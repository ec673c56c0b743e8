pub mod adapters;
pub mod canonical;
pub mod engine;
pub mod error;
pub mod mempool;
pub mod merkle;
pub mod model;
pub mod storage;

pub use adapters::{
    BlockRewardFn, CoinbaseOwnerFn, FileGenesisSource, GenesisSource, HalvingReward,
    IdentityCoinbaseOwner, PowHashFn,
};
pub use engine::{spend_message, Ledger};
pub use error::{LedgerError, LedgerResult, SubmitOutcome};
pub use mempool::{Mempool, MEMPOOL_BYTE_BUDGET};
pub use merkle::MerkleProof;
pub use model::{
    Block, DbOutput, DbTransaction, Input, Output, Transaction, MAX_BLOCK_DATA_SIZE,
    MAX_BLOCK_SIZE, MAX_TRANSACTION_SIZE,
};
pub use storage::{ReadTxn, Storage, WriteTxn};

pub use shared::{BlockchainError, Hash256, Result};
