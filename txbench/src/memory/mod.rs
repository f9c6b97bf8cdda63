//! In-memory reference backends.
//!
//! A single [`MemoryEngine`] stores tables of JSON values and runs transactions
//! with first-updater-wins write locks: writing a key another open transaction
//! already wrote, or a key committed after this transaction began, is a conflict.
//! Nothing ever waits on a lock, so conflicts surface immediately and no deadlock
//! is possible.
//!
//! The engine is exposed through both transactional models:
//! - [`MemoryDocClient`] / [`MemorySession`]: session scoped, labeled command errors.
//! - [`MemorySqlPool`] / [`MemoryConnection`]: connection scoped, SQLSTATE errors.
mod docs;
mod sql;

pub use docs::{MemoryDocClient, MemorySession};
pub use sql::{MemoryConnection, MemorySqlPool};

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;

pub type TxnId = u64;

/// Why the engine refused an operation. Each facade maps these to its own errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Another transaction holds or already committed a newer version of the key.
    Conflict { table: String, key: String },
    /// Insert of a key that already exists.
    Duplicate { table: String, key: String },
    /// The engine has been closed.
    Closed,
}

#[derive(Debug, Clone)]
struct Row {
    value: Value,
    version: u64,
}

#[derive(Debug, Default)]
struct EngineState {
    tables: HashMap<String, BTreeMap<String, Row>>,
    /// (table, key) → transaction holding the write lock.
    locks: HashMap<(String, String), TxnId>,
    /// Commit counter; every committed write gets the next value as its version.
    clock: u64,
    open: usize,
}

/// One transaction's private state. Finished transactions are inert.
#[derive(Debug)]
pub struct Txn {
    id: TxnId,
    start: u64,
    writes: BTreeMap<(String, String), Value>,
    finished: bool,
}

impl Txn {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// How [`MemoryEngine::write`] treats an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Insert,
    Upsert,
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    next_txn: AtomicU64,
    closed: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Transactions begun and not yet committed or rolled back.
    pub fn open_transactions(&self) -> usize {
        self.state.lock().open
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Committed rows of `table`, ordered by key.
    pub fn scan(&self, table: &str) -> Vec<(String, Value)> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(k, row)| (k.clone(), row.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn begin(&self) -> Result<Txn, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let mut state = self.state.lock();
        state.open += 1;
        Ok(Txn {
            id: self.next_txn.fetch_add(1, Ordering::Relaxed),
            start: state.clock,
            writes: BTreeMap::new(),
            finished: false,
        })
    }

    /// Own uncommitted writes first, then the latest committed value.
    pub fn read(&self, txn: &Txn, table: &str, key: &str) -> Option<Value> {
        if let Some(value) = txn.writes.get(&(table.to_string(), key.to_string())) {
            return Some(value.clone());
        }
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| row.value.clone())
    }

    pub fn write(
        &self,
        txn: &mut Txn,
        table: &str,
        key: &str,
        value: Value,
        mode: WriteMode,
    ) -> Result<(), EngineError> {
        let slot = (table.to_string(), key.to_string());
        let mut state = self.state.lock();
        let conflict = || EngineError::Conflict {
            table: table.to_string(),
            key: key.to_string(),
        };

        match state.locks.get(&slot) {
            Some(holder) if *holder != txn.id => return Err(conflict()),
            _ => {}
        }
        let committed = state.tables.get(table).and_then(|rows| rows.get(key));
        if committed.is_some_and(|row| row.version > txn.start) {
            return Err(conflict());
        }
        if mode == WriteMode::Insert && (committed.is_some() || txn.writes.contains_key(&slot)) {
            return Err(EngineError::Duplicate {
                table: table.to_string(),
                key: key.to_string(),
            });
        }

        state.locks.insert(slot.clone(), txn.id);
        drop(state);
        txn.writes.insert(slot, value);
        Ok(())
    }

    /// Read-modify-write of one key inside `txn`.
    pub fn update_with<F>(
        &self,
        txn: &mut Txn,
        table: &str,
        key: &str,
        f: F,
    ) -> Result<Value, EngineError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let next = f(self.read(txn, table, key));
        self.write(txn, table, key, next.clone(), WriteMode::Upsert)?;
        Ok(next)
    }

    /// A uniformly random committed row of `table`.
    pub fn sample(&self, table: &str) -> Option<(String, Value)> {
        let state = self.state.lock();
        let rows = state.tables.get(table)?;
        if rows.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..rows.len());
        rows.iter()
            .nth(pick)
            .map(|(k, row)| (k.clone(), row.value.clone()))
    }

    pub fn commit(&self, txn: &mut Txn) -> Result<(), EngineError> {
        if txn.finished {
            return Ok(());
        }
        let mut state = self.state.lock();
        if !txn.writes.is_empty() {
            state.clock += 1;
        }
        let version = state.clock;
        for ((table, key), value) in std::mem::take(&mut txn.writes) {
            state.locks.remove(&(table.clone(), key.clone()));
            state
                .tables
                .entry(table)
                .or_default()
                .insert(key, Row { value, version });
        }
        state.open -= 1;
        txn.finished = true;
        Ok(())
    }

    pub fn rollback(&self, txn: &mut Txn) {
        if txn.finished {
            return;
        }
        let mut state = self.state.lock();
        for slot in std::mem::take(&mut txn.writes).into_keys() {
            if state.locks.get(&slot) == Some(&txn.id) {
                state.locks.remove(&slot);
            }
        }
        state.open -= 1;
        txn.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn committed_writes_are_visible() {
        let engine = MemoryEngine::new();
        let mut txn = engine.begin().unwrap();
        engine
            .write(&mut txn, "seat", "1", json!({"user": 1}), WriteMode::Insert)
            .unwrap();
        assert_eq!(engine.row_count("seat"), 0);
        assert_eq!(engine.read(&txn, "seat", "1"), Some(json!({"user": 1})));

        engine.commit(&mut txn).unwrap();
        assert_eq!(engine.row_count("seat"), 1);
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn second_writer_conflicts() {
        let engine = MemoryEngine::new();
        let mut a = engine.begin().unwrap();
        let mut b = engine.begin().unwrap();

        engine
            .write(&mut a, "audit", "s1", json!(1), WriteMode::Upsert)
            .unwrap();
        let err = engine
            .write(&mut b, "audit", "s1", json!(1), WriteMode::Upsert)
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        // still conflicts once `a` committed: `b` started before that commit
        engine.commit(&mut a).unwrap();
        let err = engine
            .write(&mut b, "audit", "s1", json!(2), WriteMode::Upsert)
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
        engine.rollback(&mut b);

        let mut c = engine.begin().unwrap();
        engine
            .update_with(&mut c, "audit", "s1", |v| {
                json!(v.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
            })
            .unwrap();
        engine.commit(&mut c).unwrap();
        assert_eq!(engine.scan("audit"), vec![("s1".to_string(), json!(2))]);
    }

    #[test]
    fn rollback_releases_locks() {
        let engine = MemoryEngine::new();
        let mut a = engine.begin().unwrap();
        engine
            .write(&mut a, "seat", "1", json!(1), WriteMode::Insert)
            .unwrap();
        engine.rollback(&mut a);
        engine.rollback(&mut a);

        let mut b = engine.begin().unwrap();
        engine
            .write(&mut b, "seat", "1", json!(2), WriteMode::Insert)
            .unwrap();
        engine.commit(&mut b).unwrap();
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn duplicate_insert() {
        let engine = MemoryEngine::new();
        let mut a = engine.begin().unwrap();
        engine
            .write(&mut a, "seat", "1", json!(1), WriteMode::Insert)
            .unwrap();
        engine.commit(&mut a).unwrap();

        let mut b = engine.begin().unwrap();
        let err = engine
            .write(&mut b, "seat", "1", json!(1), WriteMode::Insert)
            .unwrap_err();
        assert!(matches!(err, EngineError::Duplicate { .. }));
    }

    #[test]
    fn closed_engine_refuses_transactions() {
        let engine = MemoryEngine::new();
        engine.close();
        assert_eq!(engine.begin().unwrap_err(), EngineError::Closed);
    }
}
