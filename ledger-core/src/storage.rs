//! Ordered key/value storage layer over `sled`.
//!
//! Named tables namespace their keys as
//! `name/{index+1}/userKey`, where index `-1` (encoded as `0`) is the
//! primary index and `>= 0` (encoded as `index + 1`) addresses secondary
//! indexes. This keeps primary and secondary scans disjoint and
//! prefix-iterable within a single `sled::Tree`.
//!
//! Only one [`WriteTxn`] may be open at a time — enforced by an exclusive
//! `std::sync::Mutex` guard held for the transaction's lifetime — and its
//! writes are buffered in memory until [`WriteTxn::commit`] flushes them as
//! a single `sled::Batch`. `sled`'s own MVCC means a [`ReadTxn`] needs no
//! lock: it simply reads the tree as of its creation instant.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{LedgerError, LedgerResult};

const PRIMARY_INDEX: i64 = -1;

fn table_key(table: &str, index: i64, user_key: &str) -> Vec<u8> {
    format!("{table}/{}/{user_key}", index + 1).into_bytes()
}

fn table_prefix(table: &str, index: i64) -> Vec<u8> {
    format!("{table}/{}/", index + 1).into_bytes()
}

/// Handle to the on-disk store. Cheap to clone; all clones share the same
/// underlying `sled::Db` and write-lock.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    write_lock: Arc<Mutex<()>>,
}

impl Storage {
    pub fn open(path: impl AsRef<std::path::Path>) -> LedgerResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// In-memory store, used by tests and the demo binary's ephemeral runs.
    pub fn temporary() -> LedgerResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Opens the single write transaction. Blocks until any other writer
    /// has committed or aborted.
    pub fn begin(&self) -> WriteTxn<'_> {
        let guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        WriteTxn {
            db: &self.db,
            _guard: guard,
            buffer: BTreeMap::new(),
        }
    }

    /// Opens a read-only snapshot. Never blocks.
    #[must_use]
    pub fn begin_read_only(&self) -> ReadTxn {
        ReadTxn { db: self.db.clone() }
    }
}

/// A buffered write transaction. Writes are invisible to other readers
/// until [`WriteTxn::commit`].
pub struct WriteTxn<'a> {
    db: &'a sled::Db,
    _guard: MutexGuard<'a, ()>,
    buffer: BTreeMap<Vec<u8>, Option<Value>>,
}

impl WriteTxn<'_> {
    pub fn put(&mut self, table: &str, key: &str, value: &Value) {
        self.buffer.insert(table_key(table, PRIMARY_INDEX, key), Some(value.clone()));
    }

    pub fn put_index(&mut self, table: &str, index: i64, key: &str, value: &Value) {
        self.buffer.insert(table_key(table, index, key), Some(value.clone()));
    }

    pub fn erase(&mut self, table: &str, key: &str) {
        self.buffer.insert(table_key(table, PRIMARY_INDEX, key), None);
    }

    pub fn erase_index(&mut self, table: &str, index: i64, key: &str) {
        self.buffer.insert(table_key(table, index, key), None);
    }

    /// Reads `key`, checking the write buffer first and falling back to
    /// the committed snapshot.
    pub fn get(&self, table: &str, key: &str) -> LedgerResult<Option<Value>> {
        self.get_index(table, PRIMARY_INDEX, key)
    }

    pub fn get_index(&self, table: &str, index: i64, key: &str) -> LedgerResult<Option<Value>> {
        let full_key = table_key(table, index, key);
        if let Some(buffered) = self.buffer.get(&full_key) {
            return Ok(buffered.clone());
        }
        match self.db.get(&full_key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Prefix-range scan in key order over `table`'s given index,
    /// observing the write buffer overlaid on the committed snapshot.
    pub fn iter_prefix(&self, table: &str, index: i64, prefix: &str) -> LedgerResult<Vec<(String, Value)>> {
        let scan_prefix = format!("{}{}", String::from_utf8_lossy(&table_prefix(table, index)), prefix);
        let mut merged: BTreeMap<String, Option<Value>> = BTreeMap::new();

        for item in self.db.scan_prefix(scan_prefix.as_bytes()) {
            let (k, v) = item?;
            let key_str = String::from_utf8_lossy(&k).into_owned();
            merged.insert(key_str, Some(serde_json::from_slice(&v)?));
        }
        for (k, v) in &self.buffer {
            let key_str = String::from_utf8_lossy(k).into_owned();
            if key_str.starts_with(&scan_prefix) {
                merged.insert(key_str, v.clone());
            }
        }

        let table_prefix_str = String::from_utf8_lossy(&table_prefix(table, index)).into_owned();
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|value| (k[table_prefix_str.len()..].to_string(), value)))
            .collect())
    }

    pub fn get_required(&self, table: &str, key: &str) -> LedgerResult<Value> {
        self.get(table, key)?
            .ok_or_else(|| LedgerError::NotFound(format!("{table}/{key}")))
    }

    /// Flushes the buffer as a single atomic batch.
    pub fn commit(self) -> LedgerResult<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in self.buffer {
            match value {
                Some(v) => batch.insert(key, serde_json::to_vec(&v)?),
                None => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Discards the buffer without writing anything.
    pub fn abort(self) {
        // Dropping self drops the buffer and releases the write guard.
    }
}

/// A read-only snapshot. Holds no lock; `sled`'s MVCC guarantees it
/// observes a consistent view as of its creation instant for any single
/// `get`, though cross-key consistency across multiple reads is only as
/// strong as `sled` provides (no multi-key snapshot isolation).
#[derive(Clone)]
pub struct ReadTxn {
    db: sled::Db,
}

impl ReadTxn {
    pub fn get(&self, table: &str, key: &str) -> LedgerResult<Option<Value>> {
        self.get_index(table, PRIMARY_INDEX, key)
    }

    pub fn get_index(&self, table: &str, index: i64, key: &str) -> LedgerResult<Option<Value>> {
        let full_key = table_key(table, index, key);
        match self.db.get(&full_key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn iter_prefix(&self, table: &str, index: i64, prefix: &str) -> LedgerResult<Vec<(String, Value)>> {
        let scan_prefix = format!("{}{}", String::from_utf8_lossy(&table_prefix(table, index)), prefix);
        let table_prefix_str = String::from_utf8_lossy(&table_prefix(table, index)).into_owned();
        let mut out = Vec::new();
        for item in self.db.scan_prefix(scan_prefix.as_bytes()) {
            let (k, v) = item?;
            let key_str = String::from_utf8_lossy(&k).into_owned();
            out.push((key_str[table_prefix_str.len()..].to_string(), serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    pub fn get_required(&self, table: &str, key: &str) -> LedgerResult<Value> {
        self.get(table, key)?
            .ok_or_else(|| LedgerError::NotFound(format!("{table}/{key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_commit_is_visible_to_new_read_txn() {
        let storage = Storage::temporary().unwrap();
        let mut txn = storage.begin();
        txn.put("blocks", "abc", &json!({"height": 1}));
        txn.commit().unwrap();

        let read = storage.begin_read_only();
        assert_eq!(read.get("blocks", "abc").unwrap(), Some(json!({"height": 1})));
    }

    #[test]
    fn abort_discards_buffered_writes() {
        let storage = Storage::temporary().unwrap();
        let mut txn = storage.begin();
        txn.put("blocks", "abc", &json!({"height": 1}));
        txn.abort();

        let read = storage.begin_read_only();
        assert_eq!(read.get("blocks", "abc").unwrap(), None);
    }

    #[test]
    fn get_within_txn_sees_buffered_write_before_commit() {
        let storage = Storage::temporary().unwrap();
        let mut txn = storage.begin();
        txn.put("blocks", "abc", &json!({"height": 1}));
        assert_eq!(txn.get("blocks", "abc").unwrap(), Some(json!({"height": 1})));
    }

    #[test]
    fn erase_removes_a_previously_committed_key() {
        let storage = Storage::temporary().unwrap();
        let mut txn = storage.begin();
        txn.put("blocks", "abc", &json!(1));
        txn.commit().unwrap();

        let mut txn2 = storage.begin();
        txn2.erase("blocks", "abc");
        txn2.commit().unwrap();

        let read = storage.begin_read_only();
        assert_eq!(read.get("blocks", "abc").unwrap(), None);
    }

    #[test]
    fn prefix_scan_is_disjoint_between_primary_and_secondary_index() {
        let storage = Storage::temporary().unwrap();
        let mut txn = storage.begin();
        txn.put("utxos", "out1", &json!({"value": 1}));
        txn.put_index("utxos", 0, "pub1out1", &json!(null));
        txn.commit().unwrap();

        let read = storage.begin_read_only();
        let primary = read.iter_prefix("utxos", -1, "").unwrap();
        let secondary = read.iter_prefix("utxos", 0, "").unwrap();
        assert_eq!(primary.len(), 1);
        assert_eq!(secondary.len(), 1);
        assert_eq!(primary[0].0, "out1");
        assert_eq!(secondary[0].0, "pub1out1");
    }

    #[test]
    fn prefix_scan_merges_buffer_over_snapshot() {
        let storage = Storage::temporary().unwrap();
        let mut txn = storage.begin();
        txn.put("blocks", "1/10", &json!("blockid10"));
        txn.commit().unwrap();

        let mut txn2 = storage.begin();
        txn2.put("blocks", "1/11", &json!("blockid11"));
        let results = txn2.iter_prefix("blocks", -1, "1/").unwrap();
        assert_eq!(results.len(), 2);
    }
}
