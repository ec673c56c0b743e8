use thiserror::Error;

/// Errors surfaced by the cryptographic and numeric primitives shared across
/// every ledger crate.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("insufficient difficulty")]
    InsufficientDifficulty,

    #[error("nonce not found")]
    NonceNotFound,

    #[error("utxo not found")]
    UtxoNotFound,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("invalid hex number: {0}")]
    InvalidHexNumber(String),

    #[error("cryptographic error: {0}")]
    CryptographicError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("network error: {0}")]
    NetworkError(String),
}

impl From<secp256k1::Error> for BlockchainError {
    fn from(err: secp256k1::Error) -> Self {
        BlockchainError::CryptographicError(err.to_string())
    }
}

impl From<aes_gcm::Error> for BlockchainError {
    fn from(_err: aes_gcm::Error) -> Self {
        BlockchainError::CryptographicError("aes-gcm operation failed".to_string())
    }
}
