pub mod bignum;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

pub use bignum::HexNum;
pub use crypto::{KeyPair, PrivateKey, PublicKey, Signature};
pub use error::BlockchainError;
pub use hash::Hash256;

pub type Result<T> = std::result::Result<T, BlockchainError>;
