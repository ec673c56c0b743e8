//! The ledger orchestrator: owns every table, accepts transactions and
//! blocks from the outside world, and is the only writer of
//! UTXO/STXO/block/mempool state. Every public entry point opens
//! exactly one write transaction and either commits it whole or aborts —
//! no partial state ever escapes.

use serde_json::{json, Value};
use shared::{crypto, Hash256};
use std::sync::RwLock;

use ledger_consensus::{BlockHeaderView, ChainView, Consensus, ConsensusHeader};
use ledger_contract::{ChainReader, ContractContext, Vm};

use crate::adapters::{BlockRewardFn, CoinbaseOwnerFn};
use crate::error::{LedgerError, LedgerResult, SubmitOutcome};
use crate::mempool::Mempool;
use crate::merkle;
use crate::model::{Block, DbOutput, DbTransaction, Input, Output, Transaction};
use crate::storage::{Storage, WriteTxn};

/// The message a per-input signature covers:
/// `input.outputId ‖ outputSetId`. Exposed so a signer outside the
/// engine (a wallet, this crate's demo binary) can produce signatures
/// the engine will accept.
#[must_use]
pub fn spend_message(output_id: &Hash256, output_set_id: &Hash256) -> Hash256 {
    Hash256::sha256_concat(&[output_id.as_bytes(), output_set_id.as_bytes()])
}

fn hash_from_hex(s: &str) -> LedgerResult<Hash256> {
    s.parse().map_err(|_| LedgerError::InvalidElement(format!("bad hash: {s}")))
}

fn bytes_from_hex(s: &str) -> LedgerResult<Vec<u8>> {
    hex::decode(s).map_err(|e| LedgerError::InvalidElement(format!("bad hex: {e}")))
}

/// Adapts a live [`WriteTxn`] to the fork-choice view consensus needs,
/// without `ledger-consensus` ever depending on this crate's concrete
/// storage types.
struct TxnChainView<'a, 'b> {
    txn: &'a WriteTxn<'b>,
}

impl ChainView for TxnChainView<'_, '_> {
    fn tip_height(&self) -> u64 {
        let Ok(Some(tip_id)) = self.txn.get("blocks", "tip") else {
            return 0;
        };
        let Some(id) = tip_id.as_str() else { return 0 };
        self.txn
            .get("blocks", id)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value::<Block>(v).ok())
            .map_or(0, |b| b.height)
    }

    fn header_at_height(&self, height: u64) -> Option<ConsensusHeader> {
        let id = self.txn.get_index("blocks", 0, &height.to_string()).ok()??;
        let id_str = id.as_str()?;
        let block_val = self.txn.get("blocks", id_str).ok()??;
        let block: Block = serde_json::from_value(block_val).ok()?;
        Some(ConsensusHeader {
            height: block.height,
            timestamp: block.timestamp,
            consensus_data: block.consensus_data,
        })
    }
}

/// Adapts a live [`WriteTxn`] to the read-only chain access contracts get
/// for the `Blockchain` global.
struct TxnChainReader<'a, 'b> {
    txn: &'a WriteTxn<'b>,
}

impl ChainReader for TxnChainReader<'_, '_> {
    fn get_block(&self, id: &Hash256) -> Option<Value> {
        self.txn.get("blocks", &id.to_hex()).ok().flatten()
    }
    fn get_transaction(&self, id: &Hash256) -> Option<Value> {
        self.txn.get("transactions", &id.to_hex()).ok().flatten()
    }
    fn get_output(&self, id: &Hash256) -> Option<Value> {
        self.txn
            .get("utxos", &id.to_hex())
            .ok()
            .flatten()
            .or_else(|| self.txn.get("stxos", &id.to_hex()).ok().flatten())
    }
    fn get_input(&self, id: &Hash256) -> Option<Value> {
        self.txn.get("inputs", &id.to_hex()).ok().flatten()
    }
}

/// The ledger engine: one instance per process per chain.
pub struct Ledger<C: Consensus> {
    storage: Storage,
    mempool: Mempool,
    consensus: C,
    block_reward: Box<dyn BlockRewardFn>,
    coinbase_owner: Box<dyn CoinbaseOwnerFn>,
    genesis_block_id: RwLock<Option<Hash256>>,
}

impl<C: Consensus> Ledger<C> {
    pub fn new(
        storage: Storage,
        consensus: C,
        block_reward: Box<dyn BlockRewardFn>,
        coinbase_owner: Box<dyn CoinbaseOwnerFn>,
    ) -> Self {
        Self {
            storage,
            mempool: Mempool::new(),
            consensus,
            block_reward,
            coinbase_owner,
            genesis_block_id: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn genesis_block_id(&self) -> Option<Hash256> {
        *self.genesis_block_id.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn mempool_count(&self) -> usize {
        self.mempool.count()
    }

    #[must_use]
    pub fn mempool_size(&self) -> usize {
        self.mempool.size_bytes()
    }

    #[must_use]
    pub fn get_unconfirmed_transactions(&self) -> Vec<Transaction> {
        self.mempool.snapshot()
    }

    /// Idempotent bootstrap: imports `genesis` if the store is empty,
    /// otherwise this is a no-op.
    #[tracing::instrument(skip(self, genesis))]
    pub fn load_chain(&self, genesis: Block) -> LedgerResult<()> {
        let read = self.storage.begin_read_only();
        if read.get("blocks", "tip")?.is_some() {
            tracing::debug!("chain already bootstrapped, skipping genesis import");
            return Ok(());
        }
        let outcome = self.submit_block(genesis, true)?;
        if !outcome.accepted {
            return Err(LedgerError::InvalidElement(
                "genesis block was rejected at bootstrap".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_block(&self, id: &Hash256) -> LedgerResult<Block> {
        let read = self.storage.begin_read_only();
        let value = read.get("blocks", &id.to_hex())?;
        let value = match value {
            Some(v) => v,
            None => read.get("candidates", &id.to_hex())?.ok_or_else(|| {
                LedgerError::NotFound(format!("block {id}"))
            })?,
        };
        serde_json::from_value(value).map_err(LedgerError::from)
    }

    pub fn get_block_by_height(&self, height: u64) -> LedgerResult<Block> {
        let read = self.storage.begin_read_only();
        let id = read.get_index("blocks", 0, &height.to_string())?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| LedgerError::NotFound(format!("block at height {height}")))?;
        let value = read.get_required("blocks", &id)?;
        serde_json::from_value(value).map_err(LedgerError::from)
    }

    pub fn get_tip(&self) -> LedgerResult<Block> {
        let read = self.storage.begin_read_only();
        let id = read.get("blocks", "tip")?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| LedgerError::NotFound("no tip yet".to_string()))?;
        let value = read.get_required("blocks", &id)?;
        serde_json::from_value(value).map_err(LedgerError::from)
    }

    pub fn get_transaction(&self, id: &Hash256) -> LedgerResult<DbTransaction> {
        let read = self.storage.begin_read_only();
        let value = read.get_required("transactions", &id.to_hex())?;
        serde_json::from_value(value).map_err(LedgerError::from)
    }

    pub fn get_output(&self, id: &Hash256) -> LedgerResult<DbOutput> {
        let read = self.storage.begin_read_only();
        let value = match read.get("utxos", &id.to_hex())? {
            Some(v) => v,
            None => read.get_required("stxos", &id.to_hex())?,
        };
        serde_json::from_value(value).map_err(LedgerError::from)
    }

    pub fn get_input(&self, id: &Hash256) -> LedgerResult<Input> {
        let read = self.storage.begin_read_only();
        let value = read.get_required("inputs", &id.to_hex())?;
        serde_json::from_value(value).map_err(LedgerError::from)
    }

    pub fn get_unspent_outputs(&self, pub_key: &str) -> LedgerResult<Vec<DbOutput>> {
        self.outputs_by_index("utxos", pub_key)
    }

    pub fn get_spent_outputs(&self, pub_key: &str) -> LedgerResult<Vec<DbOutput>> {
        self.outputs_by_index("stxos", pub_key)
    }

    fn outputs_by_index(&self, table: &str, pub_key: &str) -> LedgerResult<Vec<DbOutput>> {
        let read = self.storage.begin_read_only();
        let entries = read.iter_prefix(table, 0, pub_key)?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let output_id_hex = &key[pub_key.len()..];
            if let Some(value) = read.get(table, output_id_hex)? {
                out.push(serde_json::from_value(value)?);
            }
        }
        Ok(out)
    }

    /// `generateVerifyingBlock`: assembles a candidate block from the
    /// current tip and the mempool, paying `pub_key`. The caller
    /// (a miner) fills in the nonce and resubmits via [`Ledger::submit_block`].
    pub fn generate_verifying_block(&self, pub_key: &str, timestamp: u64) -> LedgerResult<Block> {
        let tip = self.get_tip()?;
        let height = tip.height + 1;
        let transactions = self.mempool.transactions_for_block();
        let fee: u64 = transactions.iter().map(Transaction::base_fee).sum();
        let reward = self.block_reward.block_reward(height);

        let coinbase_tx = Transaction {
            inputs: vec![],
            outputs: vec![Output {
                value: reward.saturating_add(fee),
                nonce: timestamp,
                data: json!({"publicKey": self.coinbase_owner.coinbase_owner(pub_key)}),
            }],
            timestamp,
        };

        let read = self.storage.begin_read_only();
        let chain = ReadOnlyChainView { read: &read };
        let consensus_data = self.consensus.generate_consensus_data(tip.height, &chain);

        Ok(Block {
            transactions,
            coinbase_tx,
            previous_block_id: tip.id(),
            timestamp,
            consensus_data,
            height,
            data: None,
        })
    }

    /// `submitTransaction`: validates a transaction and, if accepted,
    /// queues it in the mempool.
    #[tracing::instrument(skip(self, tx))]
    pub fn submit_transaction(&self, tx: Transaction) -> LedgerResult<SubmitOutcome> {
        if let Err(err) = tx.validate_basic() {
            tracing::warn!(%err, "rejecting malformed transaction");
            return Ok(SubmitOutcome::malformed());
        }
        let mut txn = self.storage.begin();
        let outcome = self.verify_transaction(&mut txn, &tx, tx.is_coinbase())?;
        if outcome.accepted {
            if let Err(err) = self.mempool.insert(tx) {
                txn.abort();
                return match err {
                    LedgerError::MempoolConflict(_) | LedgerError::AlreadyKnown(_) => {
                        Ok(SubmitOutcome::benign_reject())
                    }
                    other => Err(other),
                };
            }
        }
        txn.abort();
        Ok(outcome)
    }

    /// The nine-step transaction validation algorithm. Runs under the
    /// caller's write transaction so it can see in-flight state, but never
    /// itself confirms anything — confirmation is [`Ledger::confirm_transaction`].
    fn verify_transaction(
        &self,
        txn: &mut WriteTxn<'_>,
        tx: &Transaction,
        is_coinbase: bool,
    ) -> LedgerResult<SubmitOutcome> {
        let tx_id = tx.id();

        // Step 1: idempotency.
        if txn.get("transactions", &tx_id.to_hex())?.is_some() {
            return Ok(SubmitOutcome::benign_reject());
        }

        // Step 2: output uniqueness.
        for output in &tx.outputs {
            let output_id = output.id().to_hex();
            if txn.get("utxos", &output_id)?.is_some() || txn.get("stxos", &output_id)?.is_some() {
                return Ok(SubmitOutcome::malformed());
            }
        }

        if is_coinbase {
            // Steps 3-7 operate over inputs, which a coinbase has none of;
            // jump straight to the consensus hook (step 9).
            return self.finish_verification(txn, tx);
        }

        let output_set_id = tx.output_set_id();
        let mut resolved_outputs = Vec::with_capacity(tx.inputs.len());

        // Step 3: input resolution (UTXO only, never STXO).
        for input in &tx.inputs {
            let Some(value) = txn.get("utxos", &input.output_id.to_hex())? else {
                return Ok(SubmitOutcome::malformed());
            };
            let db_output: DbOutput = serde_json::from_value(value)?;
            resolved_outputs.push(db_output.output);
        }

        // Step 4-6: per-input signature rules and Schnorr aggregation.
        // Each candidate is an unsigned schnorr-keyed output awaiting
        // either a standalone signature or coverage by an aggregate.
        let mut schnorr_candidates: Vec<(Hash256, String)> = Vec::new();
        for (input, output) in tx.inputs.iter().zip(&resolved_outputs) {
            if output.contract().is_some() {
                continue; // handled entirely in step 8
            }
            let message = spend_message(&input.output_id, &output_set_id);

            if let Some(schnorr_key) = output.schnorr_key() {
                if let Some(sig_value) = input.signature() {
                    let Some(sig_hex) = sig_value.as_str() else {
                        return Ok(SubmitOutcome::malformed());
                    };
                    let (Ok(sig_bytes), Ok(key_bytes)) =
                        (bytes_from_hex(sig_hex), bytes_from_hex(schnorr_key))
                    else {
                        return Ok(SubmitOutcome::malformed());
                    };
                    if !crypto::verify_schnorr_raw(&sig_bytes, &key_bytes, &message) {
                        return Ok(SubmitOutcome::malformed());
                    }
                } else {
                    schnorr_candidates.push((output.id(), schnorr_key.to_string()));
                }
                continue;
            }

            if let Some(merkle_root_hex) = output.merkle_root() {
                let (Some(spend_type), Some(pub_key_or_script), Some(proof_value)) =
                    (input.spend_type(), input.pub_key_or_script(), input.merkle_proof())
                else {
                    return Ok(SubmitOutcome::malformed());
                };
                let proof: merkle::MerkleProof = match serde_json::from_value(proof_value.clone()) {
                    Ok(p) => p,
                    Err(_) => return Ok(SubmitOutcome::malformed()),
                };
                let expected_leaf = Hash256::sha256(pub_key_or_script.as_bytes());
                if proof.leaves.first() != Some(&expected_leaf) {
                    return Ok(SubmitOutcome::malformed());
                }
                let reconstructed = merkle::reconstruct_root(&proof);
                let Ok(expected_root) = hash_from_hex(merkle_root_hex) else {
                    return Ok(SubmitOutcome::malformed());
                };
                if reconstructed != expected_root {
                    return Ok(SubmitOutcome::malformed());
                }
                match spend_type {
                    "pubkey" => {
                        let Some(sig_hex) = input.signature().and_then(Value::as_str) else {
                            return Ok(SubmitOutcome::malformed());
                        };
                        let (Ok(sig_bytes), Ok(key_bytes)) =
                            (bytes_from_hex(sig_hex), bytes_from_hex(pub_key_or_script))
                        else {
                            return Ok(SubmitOutcome::malformed());
                        };
                        if !crypto::verify_ecdsa_raw(&sig_bytes, &key_bytes, &message) {
                            return Ok(SubmitOutcome::malformed());
                        }
                    }
                    "script" => {
                        let Ok(script_bytes) = bytes_from_hex(pub_key_or_script) else {
                            return Ok(SubmitOutcome::malformed());
                        };
                        let resolved = self.run_contract(txn, tx, input, &output_set_id, &script_bytes, &[])?;
                        if !resolved {
                            return Ok(SubmitOutcome::malformed());
                        }
                    }
                    _ => return Ok(SubmitOutcome::malformed()),
                }
                continue;
            }

            if let Some(public_key) = output.public_key() {
                let Some(sig_hex) = input.signature().and_then(Value::as_str) else {
                    return Ok(SubmitOutcome::malformed());
                };
                let (Ok(sig_bytes), Ok(key_bytes)) =
                    (bytes_from_hex(sig_hex), bytes_from_hex(public_key))
                else {
                    return Ok(SubmitOutcome::malformed());
                };
                if !crypto::verify_ecdsa_raw(&sig_bytes, &key_bytes, &message) {
                    return Ok(SubmitOutcome::malformed());
                }
            }
        }

        // Step 5: aggregate signatures consume candidates by index.
        for input in &tx.inputs {
            let Some(agg) = input.aggregate_signature() else { continue };
            let (Some(signs), Some(sig_hex)) = (
                agg.get("signs").and_then(Value::as_array),
                agg.get("signature").and_then(Value::as_str),
            ) else {
                return Ok(SubmitOutcome::malformed());
            };
            let mut selected_ids = Vec::with_capacity(signs.len());
            let mut selected_positions = Vec::with_capacity(signs.len());
            for entry in signs {
                let Some(k) = entry.as_u64() else {
                    return Ok(SubmitOutcome::malformed());
                };
                let pos = k as usize;
                if pos >= schnorr_candidates.len() {
                    return Ok(SubmitOutcome::malformed());
                }
                selected_positions.push(pos);
                selected_ids.push(schnorr_candidates[pos].0);
            }
            let mut concat = Vec::new();
            for id in &selected_ids {
                concat.extend_from_slice(id.as_bytes());
            }
            concat.extend_from_slice(output_set_id.as_bytes());
            let message = Hash256::sha256(&concat);

            let keys: Option<Vec<crypto::PublicKey>> = selected_positions
                .iter()
                .map(|&pos| {
                    bytes_from_hex(&schnorr_candidates[pos].1)
                        .ok()
                        .and_then(|bytes| crypto::PublicKey::from_bytes(&bytes).ok())
                })
                .collect();
            let Some(keys) = keys else {
                return Ok(SubmitOutcome::malformed());
            };
            let Ok(aggregate_key) = crypto::PublicKey::aggregate(&keys) else {
                return Ok(SubmitOutcome::malformed());
            };
            let Ok(sig_bytes) = bytes_from_hex(sig_hex) else {
                return Ok(SubmitOutcome::malformed());
            };
            if !crypto::verify_aggregate_raw(&sig_bytes, &aggregate_key.as_bytes(), &message) {
                return Ok(SubmitOutcome::malformed());
            }

            let mut positions_desc = selected_positions.clone();
            positions_desc.sort_unstable_by(|a, b| b.cmp(a));
            for pos in positions_desc {
                schnorr_candidates.remove(pos);
            }
        }

        // Step 6: every schnorr-keyed output must end up covered.
        if !schnorr_candidates.is_empty() {
            return Ok(SubmitOutcome::malformed());
        }

        // Step 7: value conservation and minimum fee.
        let total_in: u64 = resolved_outputs.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value))
            .ok_or_else(|| LedgerError::InvalidElement("total input value overflows u64".to_string()))?;
        let total_out = tx.total_output_value()?;
        if total_out > total_in {
            return Ok(SubmitOutcome::malformed());
        }
        let fee = total_in - total_out;
        let base_fee = tx.base_fee();
        if (fee as f64) < 0.5 * base_fee as f64 {
            return Ok(SubmitOutcome::malformed());
        }

        // Step 8: contract evaluation for contract-guarded outputs.
        for (input, output) in tx.inputs.iter().zip(&resolved_outputs) {
            let Some(contract_b64) = output.contract() else { continue };
            let Ok(bytecode) = base64_decode(contract_b64) else {
                return Ok(SubmitOutcome::malformed());
            };
            let unlocking = input
                .pub_key_or_script()
                .and_then(|s| bytes_from_hex(s).ok())
                .unwrap_or_default();
            let resolved = self.run_contract(txn, tx, input, &output_set_id, &bytecode, &unlocking)?;
            if !resolved {
                return Ok(SubmitOutcome::malformed());
            }
        }

        self.finish_verification(txn, tx)
    }

    fn run_contract(
        &self,
        txn: &WriteTxn<'_>,
        tx: &Transaction,
        input: &Input,
        output_set_id: &Hash256,
        locking: &[u8],
        unlocking: &[u8],
    ) -> LedgerResult<bool> {
        let reader = TxnChainReader { txn };
        let ctx = ContractContext {
            tx_json: serde_json::to_value(tx)?,
            this_input_json: serde_json::to_value(input)?,
            output_set_id: *output_set_id,
            chain: &reader,
        };
        let mut vm = Vm::new();
        match vm.evaluate(locking, unlocking, &ctx) {
            Ok(resolved) => Ok(resolved),
            Err(_) => Ok(false),
        }
    }

    /// Step 9: the consensus hook has the last word.
    fn finish_verification(&self, txn: &mut WriteTxn<'_>, tx: &Transaction) -> LedgerResult<SubmitOutcome> {
        let tx_value = serde_json::to_value(tx)?;
        match self.consensus.verify_transaction(&tx_value) {
            Ok(()) => Ok(SubmitOutcome::accepted()),
            Err(_) => Ok(SubmitOutcome::malformed()),
        }
    }

    /// `submitBlock`: validates a candidate block and, if it extends or
    /// beats the tip, commits it (reorganising first if needed).
    #[tracing::instrument(skip(self, block))]
    pub fn submit_block(&self, mut block: Block, is_genesis: bool) -> LedgerResult<SubmitOutcome> {
        if let Err(err) = block.validate_basic() {
            tracing::warn!(%err, "rejecting malformed block");
            return Ok(SubmitOutcome::malformed());
        }
        let block_id = block.id();
        let mut txn = self.storage.begin();

        if txn.get("blocks", &block_id.to_hex())?.is_some() {
            txn.abort();
            return Ok(SubmitOutcome::accepted());
        }

        if !is_genesis {
            let parent_exists = txn.get("blocks", &block.previous_block_id.to_hex())?.is_some()
                || txn.get("candidates", &block.previous_block_id.to_hex())?.is_some();
            if !parent_exists {
                txn.abort();
                return Ok(SubmitOutcome::malformed());
            }
        }

        let mut header_data = block.consensus_data.clone();
        {
            let chain = TxnChainView { txn: &txn };
            let mut header = BlockHeaderView {
                block_id,
                previous_block_id: block.previous_block_id,
                height: block.height,
                timestamp: block.timestamp,
                consensus_data: &mut header_data,
            };
            if !is_genesis && self.consensus.check_consensus_rules(&mut header, &chain).is_err() {
                txn.abort();
                return Ok(SubmitOutcome::malformed());
            }
        }
        block.consensus_data = header_data;

        let tip = txn.get("blocks", "tip")?.and_then(|v| v.as_str().map(str::to_string));
        let is_extending_tip = is_genesis
            || tip.as_deref() == Some(block.previous_block_id.to_hex().as_str())
            || tip.is_none();

        if !is_extending_tip {
            let tip_block: Option<Block> = tip
                .as_deref()
                .and_then(|id| txn.get("blocks", id).ok().flatten())
                .and_then(|v| serde_json::from_value(v).ok());
            let tip_consensus = tip_block.as_ref().map_or(json!({}), |b| b.consensus_data.clone());
            if self.consensus.is_block_better(&block.consensus_data, &tip_consensus) {
                self.write_candidate(&mut txn, &block)?;
                match self.reorg_chain(&mut txn, &block.previous_block_id) {
                    Ok(()) => {}
                    Err(err) => {
                        txn.abort();
                        return Err(err);
                    }
                }
            } else {
                self.write_candidate(&mut txn, &block)?;
                txn.commit()?;
                return Ok(SubmitOutcome::accepted());
            }
        }

        match self.commit_block(&mut txn, &block, is_genesis) {
            Ok(true) => {
                txn.commit()?;
                self.mempool.rescan(|tx| {
                    let mut check_txn = self.storage.begin();
                    let result = self
                        .verify_transaction(&mut check_txn, tx, tx.is_coinbase())
                        .map(|o| o.accepted)
                        .unwrap_or(false);
                    check_txn.abort();
                    result
                });
                if is_genesis {
                    *self.genesis_block_id.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(block_id);
                }
                Ok(SubmitOutcome::accepted())
            }
            Ok(false) => {
                txn.abort();
                Ok(SubmitOutcome::malformed())
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    fn write_candidate(&self, txn: &mut WriteTxn<'_>, block: &Block) -> LedgerResult<()> {
        txn.put("candidates", &block.id().to_hex(), &serde_json::to_value(block)?);
        Ok(())
    }

    /// Validates and confirms every transaction in `block`, then writes
    /// the block itself. Returns `Ok(false)` for an ordinary (malformed)
    /// rejection versus `Err` for a storage failure.
    fn commit_block(&self, txn: &mut WriteTxn<'_>, block: &Block, is_genesis: bool) -> LedgerResult<bool> {
        for tx in &block.transactions {
            let outcome = self.verify_transaction(txn, tx, false)?;
            if !outcome.accepted {
                return Ok(false);
            }
        }
        if !is_genesis {
            let fee: u64 = block.transactions.iter().map(Transaction::base_fee).sum();
            let coinbase_total = block.coinbase_tx.total_output_value()?;
            let allowed = fee.saturating_add(self.block_reward.block_reward(block.height));
            if coinbase_total > allowed {
                return Ok(false);
            }
        }
        let block_value = serde_json::to_value(block)?;
        if self.consensus.submit_block(&block_value).is_err() {
            return Ok(false);
        }

        self.confirm_transaction(txn, &block.coinbase_tx, block)?;
        for tx in &block.transactions {
            self.confirm_transaction(txn, tx, block)?;
        }

        let block_id = block.id();
        txn.put("blocks", &block_id.to_hex(), &block_value);
        txn.put("blocks", "tip", &json!(block_id.to_hex()));
        txn.put_index("blocks", 0, &block.height.to_string(), &json!(block_id.to_hex()));
        txn.erase("candidates", &block_id.to_hex());
        Ok(true)
    }

    /// Confirmation and UTXO mutation: moves spent outputs to the STXO
    /// table and inserts the transaction's own outputs as new UTXOs.
    fn confirm_transaction(&self, txn: &mut WriteTxn<'_>, tx: &Transaction, block: &Block) -> LedgerResult<()> {
        let tx_value = serde_json::to_value(tx)?;
        if let Err(err) = self.consensus.confirm_transaction(&tx_value) {
            tracing::warn!(%err, "consensus confirm_transaction hook failed (non-fatal)");
        }

        for input in &tx.inputs {
            let output_id_hex = input.output_id.to_hex();
            let Some(db_output_value) = txn.get("utxos", &output_id_hex)? else {
                return Err(LedgerError::InvalidElement(format!(
                    "confirming transaction spends missing utxo {output_id_hex}"
                )));
            };
            let db_output: DbOutput = serde_json::from_value(db_output_value.clone())?;
            txn.erase("utxos", &output_id_hex);
            txn.put("stxos", &output_id_hex, &db_output_value);
            if let Some(pub_key) = db_output.output.public_key() {
                txn.erase_index("utxos", 0, &format!("{pub_key}{output_id_hex}"));
                txn.put_index("stxos", 0, &format!("{pub_key}{output_id_hex}"), &Value::Null);
            }
            txn.put("inputs", &input.id().to_hex(), &serde_json::to_value(input)?);
        }

        for output in &tx.outputs {
            let output_id_hex = output.id().to_hex();
            let db_output = DbOutput {
                output: output.clone(),
                creation_tx: tx.id(),
            };
            txn.put("utxos", &output_id_hex, &serde_json::to_value(&db_output)?);
            if let Some(pub_key) = output.public_key() {
                txn.put_index("utxos", 0, &format!("{pub_key}{output_id_hex}"), &Value::Null);
            }
        }

        let db_tx = DbTransaction {
            input_ids: tx.input_ids_sorted(),
            output_ids: tx.output_ids_sorted(),
            confirming_block: block.id(),
            coinbase: tx.is_coinbase(),
            timestamp: tx.timestamp,
        };
        txn.put("transactions", &tx.id().to_hex(), &serde_json::to_value(&db_tx)?);
        self.mempool.remove(&tx.id());
        Ok(())
    }

    /// Reorganisation: rewinds the main chain back to the fork point
    /// shared with `new_tip_parent`'s branch, then replays that branch's
    /// blocks.
    fn reorg_chain(&self, txn: &mut WriteTxn<'_>, new_tip_parent: &Hash256) -> LedgerResult<()> {
        let mut to_replay = Vec::new();
        let mut cursor = *new_tip_parent;
        loop {
            if txn.get("blocks", &cursor.to_hex())?.is_some() {
                break;
            }
            let Some(candidate_value) = txn.get("candidates", &cursor.to_hex())? else {
                return Err(LedgerError::ConsensusReject(
                    "fork is not rooted in the known chain".to_string(),
                ));
            };
            let candidate: Block = serde_json::from_value(candidate_value)?;
            cursor = candidate.previous_block_id;
            to_replay.push(candidate);
        }
        to_replay.reverse();

        let fork_point = cursor;
        loop {
            let tip_id = txn
                .get("blocks", "tip")?
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| LedgerError::StorageFailure("no tip during reorg".to_string()))?;
            if hash_from_hex(&tip_id)? == fork_point {
                break;
            }
            self.reverse_block(txn, &hash_from_hex(&tip_id)?)?;
        }

        for block in to_replay {
            let outcome = self.commit_block(txn, &block, false)?;
            if !outcome {
                return Err(LedgerError::ConsensusReject(
                    "replayed fork block failed validation during reorg".to_string(),
                ));
            }
            let block_id = block.id();
            txn.erase("candidates", &block_id.to_hex());
        }
        Ok(())
    }

    /// Undoes the block currently at `block_id` (which must be the tip),
    /// restoring UTXO state and moving the block itself back to
    /// `candidates`.
    fn reverse_block(&self, txn: &mut WriteTxn<'_>, block_id: &Hash256) -> LedgerResult<()> {
        let block_value = txn.get_required("blocks", &block_id.to_hex())?;
        let block: Block = serde_json::from_value(block_value.clone())?;

        for tx in block.all_transactions().collect::<Vec<_>>().into_iter().rev() {
            for output in &tx.outputs {
                let output_id_hex = output.id().to_hex();
                txn.erase("utxos", &output_id_hex);
                if let Some(pub_key) = output.public_key() {
                    txn.erase_index("utxos", 0, &format!("{pub_key}{output_id_hex}"));
                }
            }
            for input in &tx.inputs {
                let output_id_hex = input.output_id.to_hex();
                if let Some(stxo_value) = txn.get("stxos", &output_id_hex)? {
                    let db_output: DbOutput = serde_json::from_value(stxo_value.clone())?;
                    txn.erase("stxos", &output_id_hex);
                    txn.put("utxos", &output_id_hex, &stxo_value);
                    if let Some(pub_key) = db_output.output.public_key() {
                        txn.erase_index("stxos", 0, &format!("{pub_key}{output_id_hex}"));
                        txn.put_index("utxos", 0, &format!("{pub_key}{output_id_hex}"), &Value::Null);
                    }
                }
                txn.erase("inputs", &input.id().to_hex());
            }
            txn.erase("transactions", &tx.id().to_hex());
            if !tx.is_coinbase() {
                let _ = self.mempool.insert(tx.clone());
            }
        }

        txn.put("candidates", &block_id.to_hex(), &block_value);
        txn.erase("blocks", &block_id.to_hex());
        txn.erase_index("blocks", 0, &block.height.to_string());
        let new_tip = block.previous_block_id.to_hex();
        txn.put("blocks", "tip", &json!(new_tip));
        Ok(())
    }
}

/// Read-only counterpart of [`TxnChainView`], used outside a write
/// transaction (e.g. while composing a candidate block).
struct ReadOnlyChainView<'a> {
    read: &'a crate::storage::ReadTxn,
}

impl ChainView for ReadOnlyChainView<'_> {
    fn tip_height(&self) -> u64 {
        let Ok(Some(tip_id)) = self.read.get("blocks", "tip") else {
            return 0;
        };
        let Some(id) = tip_id.as_str() else { return 0 };
        self.read
            .get("blocks", id)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value::<Block>(v).ok())
            .map_or(0, |b| b.height)
    }

    fn header_at_height(&self, height: u64) -> Option<ConsensusHeader> {
        let id = self.read.get_index("blocks", 0, &height.to_string()).ok()??;
        let id_str = id.as_str()?;
        let block_val = self.read.get("blocks", id_str).ok()??;
        let block: Block = serde_json::from_value(block_val).ok()?;
        Some(ConsensusHeader {
            height: block.height,
            timestamp: block.timestamp,
            consensus_data: block.consensus_data,
        })
    }
}

fn base64_decode(s: &str) -> LedgerResult<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| LedgerError::InvalidElement(format!("bad base64 contract: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HalvingReward, IdentityCoinbaseOwner};
    use ledger_consensus::Regtest;
    use shared::crypto::{KeyPair, Signature};

    fn new_ledger() -> Ledger<Regtest> {
        Ledger::new(
            Storage::temporary().unwrap(),
            Regtest,
            Box::new(HalvingReward {
                initial_reward: 100,
                halving_interval: 1_000_000,
            }),
            Box::new(IdentityCoinbaseOwner),
        )
    }

    fn genesis(pub_key: &str) -> Block {
        Block {
            transactions: vec![],
            coinbase_tx: Transaction {
                inputs: vec![],
                outputs: vec![Output {
                    value: 100,
                    nonce: 1,
                    data: json!({"publicKey": pub_key}),
                }],
                timestamp: 1,
            },
            previous_block_id: Hash256::zero(),
            timestamp: 1,
            consensus_data: json!({"isBetter": false}),
            height: 1,
            data: None,
        }
    }

    fn coinbase_block(parent: &Block, pub_key: &str, timestamp: u64, is_better: bool) -> Block {
        Block {
            transactions: vec![],
            coinbase_tx: Transaction {
                inputs: vec![],
                outputs: vec![Output {
                    value: 100,
                    nonce: timestamp,
                    data: json!({"publicKey": pub_key}),
                }],
                timestamp,
            },
            previous_block_id: parent.id(),
            timestamp,
            consensus_data: json!({"isBetter": is_better}),
            height: parent.height + 1,
            data: None,
        }
    }

    fn sign_spend(signer: &KeyPair, output_id: &Hash256, output_set_id: &Hash256) -> String {
        let message = spend_message(output_id, output_set_id);
        let Signature::Ecdsa { sig, .. } = signer.sign_ecdsa(&message).unwrap() else {
            unreachable!("ecdsa was requested")
        };
        hex::encode(sig.serialize_compact())
    }

    #[test]
    fn coinbase_utxo_listing_reports_exactly_the_mined_blocks() {
        let ledger = new_ledger();
        let other = KeyPair::generate();
        let other_pub = hex::encode(other.public_key.as_bytes());
        let p = KeyPair::generate();
        let p_pub = hex::encode(p.public_key.as_bytes());

        let gen = genesis(&other_pub);
        ledger.load_chain(gen.clone()).unwrap();

        let mut tip = gen;
        for i in 0..3 {
            let block = coinbase_block(&tip, &p_pub, 2 + i, true);
            let outcome = ledger.submit_block(block.clone(), false).unwrap();
            assert!(outcome.accepted);
            tip = block;
        }

        let unspent = ledger.get_unspent_outputs(&p_pub).unwrap();
        assert_eq!(unspent.len(), 3);
        for entry in &unspent {
            assert_eq!(entry.output.value, 100);
            assert_eq!(entry.output.public_key(), Some(p_pub.as_str()));
        }
    }

    #[test]
    fn malformed_signature_rejects_the_spend() {
        let ledger = new_ledger();
        let p = KeyPair::generate();
        let p_pub = hex::encode(p.public_key.as_bytes());

        let gen = genesis(&p_pub);
        ledger.load_chain(gen.clone()).unwrap();
        let block = coinbase_block(&gen, &p_pub, 2, true);
        ledger.submit_block(block.clone(), false).unwrap();

        let output_id = block.coinbase_tx.outputs[0].id();
        let spend = Transaction {
            inputs: vec![Input {
                output_id,
                data: json!({"signature": {"not": "a string"}}),
            }],
            outputs: vec![Output {
                value: 90,
                nonce: 1,
                data: json!({"publicKey": p_pub}),
            }],
            timestamp: 3,
        };
        let outcome = ledger.submit_transaction(spend).unwrap();
        assert!(!outcome.accepted);
        assert!(outcome.was_malformed);
    }

    #[test]
    fn second_spend_of_the_same_utxo_is_a_benign_mempool_conflict() {
        let ledger = new_ledger();
        let p = KeyPair::generate();
        let p_pub = hex::encode(p.public_key.as_bytes());

        let gen = genesis(&p_pub);
        ledger.load_chain(gen.clone()).unwrap();
        let block = coinbase_block(&gen, &p_pub, 2, true);
        ledger.submit_block(block.clone(), false).unwrap();
        let output_id = block.coinbase_tx.outputs[0].id();

        let build_spend = |nonce: u64| {
            let unsigned = Transaction {
                inputs: vec![Input {
                    output_id,
                    data: json!({}),
                }],
                outputs: vec![Output {
                    value: 90,
                    nonce,
                    data: json!({"publicKey": p_pub}),
                }],
                timestamp: 3,
            };
            let output_set_id = unsigned.output_set_id();
            let sig_hex = sign_spend(&p, &output_id, &output_set_id);
            Transaction {
                inputs: vec![Input {
                    output_id,
                    data: json!({"signature": sig_hex}),
                }],
                ..unsigned
            }
        };

        let t1 = build_spend(1);
        let t2 = build_spend(2);

        let outcome1 = ledger.submit_transaction(t1.clone()).unwrap();
        assert!(outcome1.accepted);
        let outcome2 = ledger.submit_transaction(t2).unwrap();
        assert!(!outcome2.accepted);
        assert!(!outcome2.was_malformed);

        let pending = ledger.get_unconfirmed_transactions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), t1.id());
    }

    #[test]
    fn a_strictly_heavier_fork_reverses_the_shorter_chains_spend() {
        let ledger = new_ledger();
        let p = KeyPair::generate();
        let p_pub = hex::encode(p.public_key.as_bytes());
        let other = KeyPair::generate();
        let other_pub = hex::encode(other.public_key.as_bytes());

        let gen = genesis(&other_pub);
        ledger.load_chain(gen.clone()).unwrap();

        // Chain A: genesis -> b1 (coinbase -> p) -> b2 (spend b1's coinbase)
        let b1 = coinbase_block(&gen, &p_pub, 2, false);
        ledger.submit_block(b1.clone(), false).unwrap();
        let b1_output_id = b1.coinbase_tx.outputs[0].id();

        let unsigned = Transaction {
            inputs: vec![Input {
                output_id: b1_output_id,
                data: json!({}),
            }],
            outputs: vec![Output {
                value: 90,
                nonce: 1,
                data: json!({"publicKey": other_pub}),
            }],
            timestamp: 3,
        };
        let output_set_id = unsigned.output_set_id();
        let sig_hex = sign_spend(&p, &b1_output_id, &output_set_id);
        let spend = Transaction {
            inputs: vec![Input {
                output_id: b1_output_id,
                data: json!({"signature": sig_hex}),
            }],
            ..unsigned
        };
        let b2 = Block {
            transactions: vec![spend.clone()],
            coinbase_tx: Transaction {
                inputs: vec![],
                outputs: vec![Output {
                    value: 100,
                    nonce: 99,
                    data: json!({"publicKey": p_pub}),
                }],
                timestamp: 3,
            },
            previous_block_id: b1.id(),
            timestamp: 3,
            consensus_data: json!({"isBetter": false}),
            height: 3,
            data: None,
        };
        let outcome = ledger.submit_block(b2.clone(), false).unwrap();
        assert!(outcome.accepted);

        let spend_output_id = spend.outputs[0].id();
        assert!(ledger.get_output(&spend_output_id).is_ok());

        // Chain B: genesis -> b1' -> b2' -> b3', each strictly better.
        let b1p = coinbase_block(&gen, &other_pub, 2, true);
        ledger.submit_block(b1p.clone(), false).unwrap();
        let b2p = coinbase_block(&b1p, &other_pub, 3, true);
        ledger.submit_block(b2p.clone(), false).unwrap();
        let b3p = coinbase_block(&b2p, &other_pub, 4, true);
        let outcome = ledger.submit_block(b3p.clone(), false).unwrap();
        assert!(outcome.accepted);

        let tip = ledger.get_tip().unwrap();
        assert_eq!(tip.id(), b3p.id());

        // The output T created no longer exists: its parent branch was reversed.
        assert!(ledger.get_output(&spend_output_id).is_err());

        // T's input (b1's coinbase) doesn't exist on chain B either, so it
        // cannot validly return to the mempool.
        let pending = ledger.get_unconfirmed_transactions();
        assert!(pending.iter().all(|tx| tx.id() != spend.id()));
    }
}
