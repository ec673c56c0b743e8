//! In-memory set of unconfirmed transactions with conflict-exclusion and
//! post-reorg revalidation.

use std::collections::HashMap;
use std::sync::Mutex;

use shared::Hash256;

use crate::error::{LedgerError, LedgerResult};
use crate::model::Transaction;

/// Byte budget `getTransactions()` observes when composing a candidate
/// block.
pub const MEMPOOL_BYTE_BUDGET: usize = 3 * 1024 * 1024 + 900 * 1024; // 3.9 MiB

struct MempoolState {
    by_id: HashMap<Hash256, Transaction>,
    order: Vec<Hash256>,
    inputs: HashMap<Hash256, Hash256>,
    outputs: HashMap<Hash256, Hash256>,
    total_bytes: usize,
}

impl MempoolState {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            order: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            total_bytes: 0,
        }
    }
}

/// Thread-safe mempool; every composite operation holds the mutex for its
/// whole duration so the three index maps never observe a torn update.
pub struct Mempool {
    state: Mutex<MempoolState>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MempoolState::new()),
        }
    }

    /// Inserts `tx`, rejecting on id clash, input conflict, or output
    /// double-indexing (which covers both a double-create and a
    /// double-spend of the same UTXO by two mempool transactions).
    pub fn insert(&self, tx: Transaction) -> LedgerResult<()> {
        let tx_id = tx.id();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.by_id.contains_key(&tx_id) {
            return Err(LedgerError::AlreadyKnown(format!(
                "tx {tx_id} already in mempool"
            )));
        }
        let input_ids = tx.input_ids_sorted();
        for input in &tx.inputs {
            if state.inputs.contains_key(&input.id()) {
                return Err(LedgerError::MempoolConflict(format!(
                    "input {} already pending",
                    input.id()
                )));
            }
            if state.outputs.contains_key(&input.output_id) {
                return Err(LedgerError::MempoolConflict(format!(
                    "output {} already spent by a pending tx",
                    input.output_id
                )));
            }
        }
        for output_id in tx.output_ids_sorted() {
            if state.outputs.contains_key(&output_id) {
                return Err(LedgerError::MempoolConflict(format!(
                    "output {output_id} already pending"
                )));
            }
        }

        for input in &tx.inputs {
            state.inputs.insert(input.id(), tx_id);
            state.outputs.insert(input.output_id, tx_id);
        }
        for output_id in tx.output_ids_sorted() {
            state.outputs.insert(output_id, tx_id);
        }
        let _ = input_ids;
        state.total_bytes += tx.estimated_size();
        state.order.push(tx_id);
        state.by_id.insert(tx_id, tx);
        Ok(())
    }

    pub fn remove(&self, tx_id: &Hash256) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = state.by_id.remove(tx_id) else {
            return;
        };
        state.order.retain(|id| id != tx_id);
        state.total_bytes = state.total_bytes.saturating_sub(tx.estimated_size());
        for input in &tx.inputs {
            state.inputs.remove(&input.id());
            state.outputs.remove(&input.output_id);
        }
        for output_id in tx.output_ids_sorted() {
            state.outputs.remove(&output_id);
        }
    }

    #[must_use]
    pub fn contains(&self, tx_id: &Hash256) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).by_id.contains_key(tx_id)
    }

    /// Re-validates every member against `is_valid` (typically
    /// `Ledger::verify_transaction`); members that fail are evicted.
    /// Runs after every reorg and after every committed block.
    pub fn rescan<F>(&self, mut is_valid: F)
    where
        F: FnMut(&Transaction) -> bool,
    {
        let snapshot: Vec<Transaction> = {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.order.iter().filter_map(|id| state.by_id.get(id).cloned()).collect()
        };
        for tx in snapshot {
            if !is_valid(&tx) {
                self.remove(&tx.id());
            }
        }
    }

    /// Members in insertion order, truncated to the byte budget.
    #[must_use]
    pub fn transactions_for_block(&self) -> Vec<Transaction> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        let mut used = 0usize;
        for id in &state.order {
            let Some(tx) = state.by_id.get(id) else { continue };
            let size = tx.estimated_size();
            if used + size > MEMPOOL_BYTE_BUDGET {
                break;
            }
            used += size;
            out.push(tx.clone());
        }
        out
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Transaction> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.order.iter().filter_map(|id| state.by_id.get(id).cloned()).collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).by_id.len()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::model::{Input, Output};

    fn tx_spending(output_id: Hash256, nonce: u64) -> Transaction {
        Transaction {
            inputs: vec![Input {
                output_id,
                data: json!({}),
            }],
            outputs: vec![Output {
                value: 1,
                nonce,
                data: json!({}),
            }],
            timestamp: 1,
        }
    }

    #[test]
    fn second_tx_spending_same_output_is_rejected() {
        let mempool = Mempool::new();
        let output_id = Hash256::sha256(b"utxo");
        let t1 = tx_spending(output_id, 1);
        let t2 = tx_spending(output_id, 2);

        mempool.insert(t1.clone()).unwrap();
        let result = mempool.insert(t2);
        assert!(result.is_err());
        assert_eq!(mempool.count(), 1);
        assert!(mempool.contains(&t1.id()));
    }

    #[test]
    fn remove_clears_all_indexes() {
        let mempool = Mempool::new();
        let tx = tx_spending(Hash256::sha256(b"utxo"), 1);
        mempool.insert(tx.clone()).unwrap();
        mempool.remove(&tx.id());
        assert_eq!(mempool.count(), 0);
        assert_eq!(mempool.size_bytes(), 0);

        // Re-inserting a tx spending the same output must now succeed.
        assert!(mempool.insert(tx).is_ok());
    }

    #[test]
    fn rescan_evicts_transactions_failing_the_predicate() {
        let mempool = Mempool::new();
        let keep = tx_spending(Hash256::sha256(b"a"), 1);
        let drop_tx = tx_spending(Hash256::sha256(b"b"), 2);
        mempool.insert(keep.clone()).unwrap();
        mempool.insert(drop_tx.clone()).unwrap();

        mempool.rescan(|tx| tx.id() == keep.id());

        assert_eq!(mempool.count(), 1);
        assert!(mempool.contains(&keep.id()));
        assert!(!mempool.contains(&drop_tx.id()));
    }

    #[test]
    fn transactions_for_block_respects_byte_budget() {
        let mempool = Mempool::new();
        for i in 0..5u64 {
            mempool.insert(tx_spending(Hash256::sha256(&i.to_be_bytes()), i)).unwrap();
        }
        let batch = mempool.transactions_for_block();
        assert_eq!(batch.len(), 5); // well under the 3.9 MiB budget
    }
}
