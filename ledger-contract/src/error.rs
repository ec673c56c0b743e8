use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("script exceeds maximum size of {max} bytes")]
    ScriptTooLarge { max: usize },

    #[error("unimplemented opcode: {0:#04x}")]
    UnimplementedOpcode(u8),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack exceeds maximum size of {max} items")]
    StackOverflow { max: usize },

    #[error("instruction budget of {max} exhausted")]
    InstructionBudgetExceeded { max: u64 },

    #[error("memory budget of {max} bytes exhausted")]
    MemoryBudgetExceeded { max: usize },

    #[error("contract did not leave exactly one truthy value on the stack")]
    DidNotResolve,

    #[error("malformed operand at offset {0}")]
    MalformedOperand(usize),

    #[error("invalid global reference: {0}")]
    InvalidGlobal(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),
}

pub type ContractResult<T> = std::result::Result<T, ContractError>;
