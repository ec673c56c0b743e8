//! The UTXO data model: `Output`, `Input`, `Transaction`, `Block` and their
//! database projections (`DbOutput`, `DbTransaction`).
//!
//! All ids are SHA-256 digests over a canonical byte encoding of each
//! type's immutable fields; none of them depend on mutable bookkeeping
//! fields such as a block's `consensusData`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::Hash256;

use crate::canonical::canonical_json_bytes;
use crate::error::{LedgerError, LedgerResult};
use crate::merkle;

/// Serialized transaction size ceiling.
pub const MAX_TRANSACTION_SIZE: usize = 100 * 1024;
/// Serialized block size ceiling.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;
/// `Block.data` size ceiling.
pub const MAX_BLOCK_DATA_SIZE: usize = 100 * 1024;

/// An unspent/spent transfer target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub value: u64,
    pub nonce: u64,
    pub data: Value,
}

impl Output {
    #[must_use]
    pub fn id(&self) -> Hash256 {
        let value = self.value.to_string();
        let nonce = self.nonce.to_string();
        Hash256::sha256_concat(&[
            value.as_bytes(),
            nonce.as_bytes(),
            &canonical_json_bytes(&Self::id_data(&self.data)),
            b"\n",
        ])
    }

    /// The upstream hasher reaches into `data["contract"]` and, failing
    /// to find it, `data["publicKey"]` through an accessor that inserts
    /// a null member for any key it doesn't find. Both reads happen
    /// unconditionally before the id is hashed, so the injected nulls
    /// are part of the hashed bytes.
    fn id_data(data: &Value) -> Value {
        let mut obj = match data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        obj.entry("contract".to_string()).or_insert(Value::Null);
        let contract_is_empty = match obj.get("contract") {
            Some(Value::Array(a)) => a.is_empty(),
            Some(Value::Object(o)) => o.is_empty(),
            Some(Value::Null) | None => true,
            Some(_) => false,
        };
        if contract_is_empty {
            obj.entry("publicKey".to_string()).or_insert(Value::Null);
        }
        Value::Object(obj)
    }

    pub fn validate_basic(&self) -> LedgerResult<()> {
        if self.value == 0 {
            return Err(LedgerError::InvalidElement(
                "output value must be at least 1".to_string(),
            ));
        }
        if !self.data.is_object() {
            return Err(LedgerError::InvalidElement(
                "output data must be a JSON object".to_string(),
            ));
        }
        if self.data.get("contract").is_some()
            && (self.data.get("publicKey").is_some()
                || self.data.get("schnorrKey").is_some()
                || self.data.get("merkleRoot").is_some())
        {
            return Err(LedgerError::InvalidElement(
                "contract output must not also carry a keyed spend condition".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn public_key(&self) -> Option<&str> {
        self.data.get("publicKey").and_then(Value::as_str)
    }

    #[must_use]
    pub fn schnorr_key(&self) -> Option<&str> {
        self.data.get("schnorrKey").and_then(Value::as_str)
    }

    #[must_use]
    pub fn merkle_root(&self) -> Option<&str> {
        self.data.get("merkleRoot").and_then(Value::as_str)
    }

    #[must_use]
    pub fn contract(&self) -> Option<&str> {
        self.data.get("contract").and_then(Value::as_str)
    }
}

/// `Output` plus a back-pointer to the transaction that created it, as
/// stored in the UTXO/STXO tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbOutput {
    #[serde(flatten)]
    pub output: Output,
    pub creation_tx: Hash256,
}

/// Spends a prior output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub output_id: Hash256,
    pub data: Value,
}

impl Input {
    #[must_use]
    pub fn id(&self) -> Hash256 {
        let output_id = self.output_id.to_hex();
        Hash256::sha256_concat(&[
            output_id.as_bytes(),
            &canonical_json_bytes(&self.data),
            b"\n",
        ])
    }

    pub fn validate_basic(&self) -> LedgerResult<()> {
        if !self.data.is_object() {
            return Err(LedgerError::InvalidElement(
                "input data must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn signature(&self) -> Option<&Value> {
        self.data.get("signature")
    }

    #[must_use]
    pub fn aggregate_signature(&self) -> Option<&Value> {
        self.data.get("aggregateSignature")
    }

    #[must_use]
    pub fn spend_type(&self) -> Option<&str> {
        self.data.get("spendType").and_then(Value::as_str)
    }

    #[must_use]
    pub fn pub_key_or_script(&self) -> Option<&str> {
        self.data.get("pubKeyOrScript").and_then(Value::as_str)
    }

    #[must_use]
    pub fn merkle_proof(&self) -> Option<&Value> {
        self.data.get("merkleProof")
    }
}

/// A set of inputs spent and a non-empty set of outputs created, atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub timestamp: u64,
}

impl Transaction {
    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    #[must_use]
    pub fn output_ids_sorted(&self) -> Vec<Hash256> {
        let mut ids: Vec<Hash256> = self.outputs.iter().map(Output::id).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn input_ids_sorted(&self) -> Vec<Hash256> {
        let mut ids: Vec<Hash256> = self.inputs.iter().map(Input::id).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn output_set_id(&self) -> Hash256 {
        merkle::root(&self.output_ids_sorted())
    }

    #[must_use]
    pub fn input_set_root(&self) -> Hash256 {
        if self.is_coinbase() {
            Hash256::zero()
        } else {
            merkle::root(&self.input_ids_sorted())
        }
    }

    #[must_use]
    pub fn id(&self) -> Hash256 {
        let input_root_hex = (!self.is_coinbase()).then(|| self.input_set_root().to_hex());
        let output_root_hex = self.output_set_id().to_hex();
        let timestamp = self.timestamp.to_string();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(3);
        if let Some(hex) = &input_root_hex {
            parts.push(hex.as_bytes());
        }
        parts.push(output_root_hex.as_bytes());
        parts.push(timestamp.as_bytes());
        Hash256::sha256_concat(&parts)
    }

    #[must_use]
    pub fn estimated_size(&self) -> usize {
        canonical_json_bytes(&serde_json::to_value(self).unwrap_or(Value::Null)).len()
    }

    pub fn total_output_value(&self) -> LedgerResult<u64> {
        self.outputs.iter().try_fold(0u64, |acc, out| {
            acc.checked_add(out.value).ok_or_else(|| {
                LedgerError::InvalidElement("total output value overflows u64".to_string())
            })
        })
    }

    pub fn validate_basic(&self) -> LedgerResult<()> {
        if self.outputs.is_empty() {
            return Err(LedgerError::InvalidElement(
                "transaction must have at least one output".to_string(),
            ));
        }
        if self.is_coinbase() && self.inputs.is_empty() {
            // coinbase: zero inputs is required, nothing further to check here
        }
        self.total_output_value()?;
        if self.estimated_size() > MAX_TRANSACTION_SIZE {
            return Err(LedgerError::InvalidElement(format!(
                "transaction exceeds {MAX_TRANSACTION_SIZE} bytes"
            )));
        }
        for output in &self.outputs {
            output.validate_basic()?;
        }
        for input in &self.inputs {
            input.validate_basic()?;
        }

        let output_ids = self.output_ids_sorted();
        for pair in output_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(LedgerError::InvalidElement(
                    "duplicate output id within transaction".to_string(),
                ));
            }
        }
        let input_output_ids: Vec<Hash256> = {
            let mut ids: Vec<Hash256> = self.inputs.iter().map(|i| i.output_id).collect();
            ids.sort();
            ids
        };
        for pair in input_output_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(LedgerError::InvalidElement(
                    "duplicate input outputId within transaction".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Base fee: 100 bytes-equivalent per element of canonical-json
    /// `data`, summed over every input and output.
    #[must_use]
    pub fn base_fee(&self) -> u64 {
        let mut total = 0u64;
        for input in &self.inputs {
            total += 100 * canonical_json_bytes(&input.data).len() as u64;
        }
        for output in &self.outputs {
            total += 100 * canonical_json_bytes(&output.data).len() as u64;
        }
        total
    }
}

/// `Transaction`'s confirmed-state projection, as stored in `transactions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbTransaction {
    pub input_ids: Vec<Hash256>,
    pub output_ids: Vec<Hash256>,
    pub confirming_block: Hash256,
    pub coinbase: bool,
    pub timestamp: u64,
}

/// An ordered batch of transactions under one proof-of-work (or other
/// consensus) header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub transactions: Vec<Transaction>,
    pub coinbase_tx: Transaction,
    pub previous_block_id: Hash256,
    pub timestamp: u64,
    pub consensus_data: Value,
    pub height: u64,
    pub data: Option<Value>,
}

impl Block {
    #[must_use]
    pub fn transaction_ids_sorted(&self) -> Vec<Hash256> {
        let mut ids: Vec<Hash256> = self.transactions.iter().map(Transaction::id).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn transaction_merkle_root(&self) -> Hash256 {
        merkle::root(&self.transaction_ids_sorted())
    }

    /// Excludes `consensusData` deliberately, so mutating it in place (to
    /// fill in the recomputed target/work) never renames the block.
    #[must_use]
    pub fn id(&self) -> Hash256 {
        let tx_root_hex = (!self.transactions.is_empty()).then(|| self.transaction_merkle_root().to_hex());
        let coinbase_id_hex = self.coinbase_tx.id().to_hex();
        let previous_block_id_hex = self.previous_block_id.to_hex();
        let timestamp = self.timestamp.to_string();
        let mut data_bytes = self
            .data
            .as_ref()
            .map(canonical_json_bytes)
            .unwrap_or_else(|| b"null".to_vec());
        data_bytes.push(b'\n');

        let mut parts: Vec<&[u8]> = Vec::with_capacity(5);
        if let Some(hex) = &tx_root_hex {
            parts.push(hex.as_bytes());
        }
        parts.push(coinbase_id_hex.as_bytes());
        parts.push(previous_block_id_hex.as_bytes());
        parts.push(timestamp.as_bytes());
        parts.push(&data_bytes);
        Hash256::sha256_concat(&parts)
    }

    #[must_use]
    pub fn estimated_size(&self) -> usize {
        canonical_json_bytes(&serde_json::to_value(self).unwrap_or(Value::Null)).len()
    }

    /// All contained transactions, coinbase first, in the order the
    /// engine processes them.
    pub fn all_transactions(&self) -> impl Iterator<Item = &Transaction> {
        std::iter::once(&self.coinbase_tx).chain(self.transactions.iter())
    }

    pub fn validate_basic(&self) -> LedgerResult<()> {
        if !self.coinbase_tx.is_coinbase() {
            return Err(LedgerError::InvalidElement(
                "coinbaseTx must have zero inputs".to_string(),
            ));
        }
        self.coinbase_tx.validate_basic()?;
        for tx in &self.transactions {
            if tx.is_coinbase() {
                return Err(LedgerError::InvalidElement(
                    "only the designated coinbaseTx may have zero inputs".to_string(),
                ));
            }
            tx.validate_basic()?;
        }

        if let Some(data) = &self.data {
            if !data.is_object() && !data.is_null() {
                return Err(LedgerError::InvalidElement(
                    "block data must be an object or null".to_string(),
                ));
            }
            if canonical_json_bytes(data).len() > MAX_BLOCK_DATA_SIZE {
                return Err(LedgerError::InvalidElement(format!(
                    "block data exceeds {MAX_BLOCK_DATA_SIZE} bytes"
                )));
            }
        }

        if self.estimated_size() > MAX_BLOCK_SIZE {
            return Err(LedgerError::InvalidElement(format!(
                "block exceeds {MAX_BLOCK_SIZE} bytes"
            )));
        }

        let mut all_output_ids: Vec<Hash256> = Vec::new();
        let mut all_input_output_ids: Vec<Hash256> = Vec::new();
        for tx in self.all_transactions() {
            all_output_ids.extend(tx.outputs.iter().map(Output::id));
            all_input_output_ids.extend(tx.inputs.iter().map(|i| i.output_id));
        }
        all_output_ids.sort();
        for pair in all_output_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(LedgerError::InvalidElement(
                    "duplicate output across transactions in block".to_string(),
                ));
            }
        }
        all_input_output_ids.sort();
        for pair in all_input_output_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(LedgerError::InvalidElement(
                    "duplicate input across transactions in block".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_output(value: u64) -> Output {
        Output {
            value,
            nonce: 1,
            data: json!({"publicKey": "abc"}),
        }
    }

    #[test]
    fn output_id_depends_only_on_value_nonce_data() {
        let a = sample_output(10);
        let b = sample_output(10);
        assert_eq!(a.id(), b.id());
        let c = sample_output(11);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn output_id_matches_seed_scenario_six() {
        let output = Output {
            value: 8_081_988_463,
            nonce: 4_062_896_946,
            data: json!({"publicKey": "BMoEeFbdyC8blWvlklSJ2oKRjEJfcq08+HZkmQW1ICJpC7nebygMt5AXhXDiwHuEF4KlHuJBwNGatpKifhoqp4s="}),
        };
        assert_eq!(
            output.id().to_hex(),
            "ff8840289b59187d16521ddde6b19de1c1b8994220a4dbb112f5978b34605b17"
        );
    }

    #[test]
    fn coinbase_transaction_has_zero_inputs() {
        let tx = Transaction {
            inputs: vec![],
            outputs: vec![sample_output(50)],
            timestamp: 1,
        };
        assert!(tx.is_coinbase());
        assert_eq!(tx.input_set_root(), Hash256::zero());
    }

    #[test]
    fn transaction_id_depends_only_on_inputs_outputs_timestamp() {
        let tx_a = Transaction {
            inputs: vec![],
            outputs: vec![sample_output(10)],
            timestamp: 5,
        };
        let tx_b = tx_a.clone();
        assert_eq!(tx_a.id(), tx_b.id());
    }

    #[test]
    fn transaction_rejects_empty_outputs() {
        let tx = Transaction {
            inputs: vec![],
            outputs: vec![],
            timestamp: 1,
        };
        assert!(tx.validate_basic().is_err());
    }

    #[test]
    fn transaction_rejects_duplicate_outputs() {
        let out = sample_output(10);
        let tx = Transaction {
            inputs: vec![],
            outputs: vec![out.clone(), out],
            timestamp: 1,
        };
        assert!(tx.validate_basic().is_err());
    }

    #[test]
    fn contract_output_cannot_also_carry_a_public_key() {
        let out = Output {
            value: 1,
            nonce: 1,
            data: json!({"contract": "BASE64==", "publicKey": "abc"}),
        };
        assert!(out.validate_basic().is_err());
    }

    #[test]
    fn block_id_excludes_consensus_data() {
        let coinbase = Transaction {
            inputs: vec![],
            outputs: vec![sample_output(50)],
            timestamp: 1,
        };
        let mut block = Block {
            transactions: vec![],
            coinbase_tx: coinbase,
            previous_block_id: Hash256::zero(),
            timestamp: 100,
            consensus_data: json!({"nonce": 0}),
            height: 1,
            data: None,
        };
        let id_before = block.id();
        block.consensus_data = json!({"nonce": 999_999});
        assert_eq!(id_before, block.id());
    }

    #[test]
    fn block_rejects_non_coinbase_tx_marked_as_coinbase_slot() {
        let not_coinbase = Transaction {
            inputs: vec![Input {
                output_id: Hash256::zero(),
                data: json!({}),
            }],
            outputs: vec![sample_output(1)],
            timestamp: 1,
        };
        let block = Block {
            transactions: vec![],
            coinbase_tx: not_coinbase,
            previous_block_id: Hash256::zero(),
            timestamp: 1,
            consensus_data: json!({}),
            height: 1,
            data: None,
        };
        assert!(block.validate_basic().is_err());
    }
}
