use thiserror::Error;

/// The ledger engine's error taxonomy: every public operation's failure
/// mode collapses into one of these kinds.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed record: bad sizes, duplicate ids, missing fields, overflow.
    #[error("invalid element: {0}")]
    InvalidElement(String),

    /// Lookup by id or height missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Block or transaction failed a consensus/rule check.
    #[error("consensus reject: {0}")]
    ConsensusReject(String),

    /// Valid on-chain but conflicts with a pending mempool transaction.
    #[error("mempool conflict: {0}")]
    MempoolConflict(String),

    /// Already on the main chain / already confirmed.
    #[error("already known: {0}")]
    AlreadyKnown(String),

    /// Storage backend commit/read failure.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Contract memory or instruction ceiling exceeded.
    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),
}

impl From<shared::BlockchainError> for LedgerError {
    fn from(err: shared::BlockchainError) -> Self {
        LedgerError::InvalidElement(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::InvalidElement(format!("json: {err}"))
    }
}

impl From<ledger_contract::ContractError> for LedgerError {
    fn from(err: ledger_contract::ContractError) -> Self {
        use ledger_contract::ContractError as CE;
        match err {
            CE::InstructionBudgetExceeded { .. } | CE::MemoryBudgetExceeded { .. } => {
                LedgerError::ResourceExceeded(err.to_string())
            }
            CE::ScriptTooLarge { .. }
            | CE::UnimplementedOpcode(_)
            | CE::StackUnderflow
            | CE::StackOverflow { .. }
            | CE::MalformedOperand(_)
            | CE::InvalidGlobal(_)
            | CE::Crypto(_) => LedgerError::InvalidElement(err.to_string()),
            CE::DidNotResolve => LedgerError::ConsensusReject(err.to_string()),
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// The two-bit `(accepted, wasMalformed)` result used to distinguish a
/// benign rejection from protocol-violating input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub was_malformed: bool,
}

impl SubmitOutcome {
    #[must_use]
    pub const fn accepted() -> Self {
        Self {
            accepted: true,
            was_malformed: false,
        }
    }

    #[must_use]
    pub const fn malformed() -> Self {
        Self {
            accepted: false,
            was_malformed: true,
        }
    }

    #[must_use]
    pub const fn benign_reject() -> Self {
        Self {
            accepted: false,
            was_malformed: false,
        }
    }
}
