pub mod error;
pub mod vm;

pub use error::{ContractError, ContractResult};
pub use vm::{
    ChainReader, ContractContext, NullChainReader, OpCode, StackItem, Vm, MAX_INSTRUCTIONS,
    MAX_MEMORY_BYTES, MAX_SCRIPT_SIZE, MAX_STACK_SIZE,
};
