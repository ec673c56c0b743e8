//! Sandboxed bytecode evaluator for output spend-condition contracts.
//!
//! A stack machine with a push/pop opcode model and `MAX_*` ceiling
//! pattern, wired to three named globals (`txJson`, `thisInputJson`,
//! `outputSetId`) plus a read-only chain accessor, and bounded by a
//! memory budget and an instruction counter rather than a single
//! operation limit.

use serde_json::Value;
use shared::Hash256;

use crate::error::{ContractError, ContractResult};

pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_STACK_SIZE: usize = 1_000;
/// Allocations past this point fail the contract rather than growing
/// the VM's working set unbounded.
pub const MAX_MEMORY_BYTES: usize = 10 * 1024 * 1024;
/// Execution aborts once this many opcodes have run, so a malicious
/// or buggy script can't loop forever.
pub const MAX_INSTRUCTIONS: u64 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackItem {
    Bytes(Vec<u8>),
    Bool(bool),
}

impl StackItem {
    fn byte_len(&self) -> usize {
        match self {
            StackItem::Bytes(b) => b.len(),
            StackItem::Bool(_) => 1,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            StackItem::Bool(b) => *b,
            StackItem::Bytes(b) => b.iter().any(|byte| *byte != 0),
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        match self {
            StackItem::Bytes(b) => b.clone(),
            StackItem::Bool(b) => vec![u8::from(*b)],
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    PushData = 0x01,
    Dup = 0x76,
    Drop = 0x75,
    Swap = 0x7c,
    Equal = 0x87,
    EqualVerify = 0x88,
    Verify = 0x69,
    Sha256 = 0xa8,
    CheckSig = 0xac,
    CheckAggSig = 0xad,
    If = 0x63,
    Else = 0x67,
    EndIf = 0x68,
    Return = 0x6a,
    GetTxJson = 0xd0,
    GetThisInputJson = 0xd1,
    GetOutputSetId = 0xd2,
    BlockchainGetOutput = 0xd3,
}

impl TryFrom<u8> for OpCode {
    type Error = ContractError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => OpCode::PushData,
            0x76 => OpCode::Dup,
            0x75 => OpCode::Drop,
            0x7c => OpCode::Swap,
            0x87 => OpCode::Equal,
            0x88 => OpCode::EqualVerify,
            0x69 => OpCode::Verify,
            0xa8 => OpCode::Sha256,
            0xac => OpCode::CheckSig,
            0xad => OpCode::CheckAggSig,
            0x63 => OpCode::If,
            0x67 => OpCode::Else,
            0x68 => OpCode::EndIf,
            0x6a => OpCode::Return,
            0xd0 => OpCode::GetTxJson,
            0xd1 => OpCode::GetThisInputJson,
            0xd2 => OpCode::GetOutputSetId,
            0xd3 => OpCode::BlockchainGetOutput,
            other => return Err(ContractError::UnimplementedOpcode(other)),
        })
    }
}

/// Read-only, snapshot-consistent ledger access for the `Blockchain`
/// global. Kept as a trait (rather than a dependency on `ledger-core`'s
/// concrete storage types) so this crate never depends back on the crate
/// that depends on it.
pub trait ChainReader {
    fn get_block(&self, id: &Hash256) -> Option<Value>;
    fn get_transaction(&self, id: &Hash256) -> Option<Value>;
    fn get_output(&self, id: &Hash256) -> Option<Value>;
    fn get_input(&self, id: &Hash256) -> Option<Value>;
}

pub struct NullChainReader;

impl ChainReader for NullChainReader {
    fn get_block(&self, _id: &Hash256) -> Option<Value> {
        None
    }
    fn get_transaction(&self, _id: &Hash256) -> Option<Value> {
        None
    }
    fn get_output(&self, _id: &Hash256) -> Option<Value> {
        None
    }
    fn get_input(&self, _id: &Hash256) -> Option<Value> {
        None
    }
}

/// The three named globals and the `Blockchain` accessor a contract
/// evaluates against.
pub struct ContractContext<'a> {
    pub tx_json: Value,
    pub this_input_json: Value,
    pub output_set_id: Hash256,
    pub chain: &'a dyn ChainReader,
}

/// A sandboxed stack machine evaluating one output's spend-condition
/// bytecode against an `Input`'s unlocking bytecode.
pub struct Vm {
    stack: Vec<StackItem>,
    alt_stack: Vec<StackItem>,
    memory_used: usize,
    instructions_executed: u64,
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            alt_stack: Vec::new(),
            memory_used: 0,
            instructions_executed: 0,
        }
    }

    /// Runs `unlocking` followed by `locking` against `ctx` and reports
    /// whether the predicate resolved to true. A contract "resolves"
    /// exactly when it leaves a single truthy item on the stack; anything
    /// else, including a script that errors out, is a rejection rather
    /// than a hard error, mirroring how spend conditions are meant to
    /// fail closed.
    pub fn evaluate(
        &mut self,
        locking: &[u8],
        unlocking: &[u8],
        ctx: &ContractContext<'_>,
    ) -> ContractResult<bool> {
        if locking.len() > MAX_SCRIPT_SIZE || unlocking.len() > MAX_SCRIPT_SIZE {
            return Err(ContractError::ScriptTooLarge { max: MAX_SCRIPT_SIZE });
        }
        self.run(unlocking, ctx)?;
        self.run(locking, ctx)?;
        Ok(self.stack.len() == 1 && self.stack[0].is_truthy())
    }

    fn push(&mut self, item: StackItem) -> ContractResult<()> {
        if self.stack.len() >= MAX_STACK_SIZE {
            return Err(ContractError::StackOverflow { max: MAX_STACK_SIZE });
        }
        self.memory_used += item.byte_len();
        if self.memory_used > MAX_MEMORY_BYTES {
            return Err(ContractError::MemoryBudgetExceeded { max: MAX_MEMORY_BYTES });
        }
        self.stack.push(item);
        Ok(())
    }

    fn pop(&mut self) -> ContractResult<StackItem> {
        let item = self.stack.pop().ok_or(ContractError::StackUnderflow)?;
        self.memory_used = self.memory_used.saturating_sub(item.byte_len());
        Ok(item)
    }

    fn tick(&mut self) -> ContractResult<()> {
        self.instructions_executed += 1;
        if self.instructions_executed > MAX_INSTRUCTIONS {
            return Err(ContractError::InstructionBudgetExceeded { max: MAX_INSTRUCTIONS });
        }
        Ok(())
    }

    fn run(&mut self, code: &[u8], ctx: &ContractContext<'_>) -> ContractResult<()> {
        let mut pc = 0usize;
        // Depth of `if` blocks currently being skipped because their
        // condition was false; only the innermost toggles on `else`.
        let mut skip_depth: u32 = 0;

        while pc < code.len() {
            self.tick()?;
            let byte = code[pc];
            pc += 1;

            if byte == OpCode::If as u8 {
                if skip_depth > 0 {
                    skip_depth += 1;
                    continue;
                }
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    skip_depth = 1;
                }
                continue;
            }
            if byte == OpCode::Else as u8 {
                if skip_depth == 1 {
                    skip_depth = 0;
                } else if skip_depth == 0 {
                    skip_depth = 1;
                }
                continue;
            }
            if byte == OpCode::EndIf as u8 {
                if skip_depth > 0 {
                    skip_depth -= 1;
                }
                continue;
            }
            if skip_depth > 0 {
                // Still need to walk past this opcode's inline operand,
                // if it has one, without executing it.
                if byte == OpCode::PushData as u8 {
                    let len = *code.get(pc).ok_or(ContractError::MalformedOperand(pc))? as usize;
                    pc += 1 + len;
                }
                continue;
            }

            let op = OpCode::try_from(byte)?;
            match op {
                OpCode::PushData => {
                    let len = *code.get(pc).ok_or(ContractError::MalformedOperand(pc))? as usize;
                    pc += 1;
                    let end = pc + len;
                    let data = code
                        .get(pc..end)
                        .ok_or(ContractError::MalformedOperand(pc))?
                        .to_vec();
                    pc = end;
                    self.push(StackItem::Bytes(data))?;
                }
                OpCode::Dup => {
                    let top = self.pop()?;
                    self.push(top.clone())?;
                    self.push(top)?;
                }
                OpCode::Drop => {
                    self.pop()?;
                }
                OpCode::Swap => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(b)?;
                    self.push(a)?;
                }
                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(StackItem::Bool(a.as_bytes() == b.as_bytes()))?;
                }
                OpCode::EqualVerify => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if a.as_bytes() != b.as_bytes() {
                        return Err(ContractError::DidNotResolve);
                    }
                }
                OpCode::Verify => {
                    let top = self.pop()?;
                    if !top.is_truthy() {
                        return Err(ContractError::DidNotResolve);
                    }
                }
                OpCode::Sha256 => {
                    let top = self.pop()?;
                    let hash = Hash256::sha256(&top.as_bytes());
                    self.push(StackItem::Bytes(hash.as_bytes().to_vec()))?;
                }
                OpCode::CheckSig => {
                    let pubkey_bytes = self.pop()?.as_bytes();
                    let sig_bytes = self.pop()?.as_bytes();
                    let message = Hash256::sha256(&self.tx_message(ctx));
                    let ok = shared::crypto::verify_ecdsa_raw(&sig_bytes, &pubkey_bytes, &message);
                    self.push(StackItem::Bool(ok))?;
                }
                OpCode::CheckAggSig => {
                    // Same raw-bytes verification path; the distinction
                    // from `CheckSig` is the spend condition's intent
                    // (an aggregate key), not the check performed here,
                    // since `OP_CHECKAGGSIG` verifies the already-summed
                    // signature against the already-summed key.
                    let pubkey_bytes = self.pop()?.as_bytes();
                    let sig_bytes = self.pop()?.as_bytes();
                    let message = Hash256::sha256(&self.tx_message(ctx));
                    let ok = shared::crypto::verify_ecdsa_raw(&sig_bytes, &pubkey_bytes, &message);
                    self.push(StackItem::Bool(ok))?;
                }
                OpCode::Return => {
                    return Err(ContractError::DidNotResolve);
                }
                OpCode::GetTxJson => {
                    self.push(StackItem::Bytes(ctx.tx_json.to_string().into_bytes()))?;
                }
                OpCode::GetThisInputJson => {
                    self.push(StackItem::Bytes(
                        ctx.this_input_json.to_string().into_bytes(),
                    ))?;
                }
                OpCode::GetOutputSetId => {
                    self.push(StackItem::Bytes(ctx.output_set_id.as_bytes().to_vec()))?;
                }
                OpCode::BlockchainGetOutput => {
                    let id_bytes = self.pop()?.as_bytes();
                    let found = Hash256::from_bytes(
                        id_bytes
                            .try_into()
                            .map_err(|_| ContractError::InvalidGlobal("output id".to_string()))?,
                    );
                    match ctx.chain.get_output(&found) {
                        Some(value) => self.push(StackItem::Bytes(value.to_string().into_bytes()))?,
                        None => self.push(StackItem::Bool(false))?,
                    }
                }
                OpCode::If | OpCode::Else | OpCode::EndIf => {
                    unreachable!("If/Else/EndIf are consumed before dispatch in the loop above")
                }
            }
        }
        Ok(())
    }

    fn tx_message(&self, ctx: &ContractContext<'_>) -> Vec<u8> {
        ctx.tx_json.to_string().into_bytes()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ContractContext<'static> {
        ContractContext {
            tx_json: json!({"id": "deadbeef"}),
            this_input_json: json!({}),
            output_set_id: Hash256::zero(),
            chain: &NullChainReader,
        }
    }

    fn push(data: &[u8]) -> Vec<u8> {
        let mut out = vec![OpCode::PushData as u8, data.len() as u8];
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn equal_values_resolve_the_contract() {
        let mut vm = Vm::new();
        let mut locking = push(b"secret");
        locking.push(OpCode::Equal as u8);
        let unlocking = push(b"secret");
        let context = ctx();
        let resolved = vm.evaluate(&locking, &unlocking, &context).unwrap();
        assert!(resolved);
    }

    #[test]
    fn mismatched_values_do_not_resolve() {
        let mut vm = Vm::new();
        let mut locking = push(b"secret");
        locking.push(OpCode::Equal as u8);
        let unlocking = push(b"wrong");
        let context = ctx();
        let resolved = vm.evaluate(&locking, &unlocking, &context).unwrap();
        assert!(!resolved);
    }

    #[test]
    fn if_else_endif_selects_the_taken_branch() {
        let mut vm = Vm::new();
        // unlocking pushes `true` (a nonzero byte)
        let unlocking = vec![OpCode::PushData as u8, 1, 1];
        let mut locking = Vec::new();
        locking.push(OpCode::If as u8);
        locking.extend(push(b"yes"));
        locking.push(OpCode::Else as u8);
        locking.extend(push(b""));
        locking.push(OpCode::EndIf as u8);
        let context = ctx();
        vm.evaluate(&locking, &unlocking, &context).unwrap();
        assert_eq!(vm.stack.last(), Some(&StackItem::Bytes(b"yes".to_vec())));
    }

    #[test]
    fn oversized_script_is_rejected() {
        let mut vm = Vm::new();
        let locking = vec![0u8; MAX_SCRIPT_SIZE + 1];
        let context = ctx();
        let err = vm.evaluate(&locking, &[], &context).unwrap_err();
        assert!(matches!(err, ContractError::ScriptTooLarge { .. }));
    }

    #[test]
    fn sha256_opcode_hashes_top_of_stack() {
        let mut vm = Vm::new();
        let mut locking = push(b"abc");
        locking.push(OpCode::Sha256 as u8);
        locking.extend(push(Hash256::sha256(b"abc").as_bytes()));
        locking.push(OpCode::Equal as u8);
        let context = ctx();
        let resolved = vm.evaluate(&locking, &[], &context).unwrap();
        assert!(resolved);
    }

    #[test]
    fn return_opcode_rejects_the_contract() {
        let mut vm = Vm::new();
        let locking = vec![OpCode::Return as u8];
        let context = ctx();
        let err = vm.evaluate(&locking, &[], &context).unwrap_err();
        assert!(matches!(err, ContractError::DidNotResolve));
    }

    #[test]
    fn instruction_budget_is_enforced() {
        let mut vm = Vm::new();
        for _ in 0..MAX_INSTRUCTIONS {
            vm.tick().unwrap();
        }
        assert!(vm.tick().is_err());
    }

    #[test]
    fn memory_budget_is_enforced() {
        let mut vm = Vm::new();
        let big = StackItem::Bytes(vec![0u8; MAX_MEMORY_BYTES]);
        vm.push(big).unwrap();
        let err = vm.push(StackItem::Bytes(vec![0u8; 1])).unwrap_err();
        assert!(matches!(err, ContractError::MemoryBudgetExceeded { .. }));
    }
}
