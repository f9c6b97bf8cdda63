use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{EngineError, MemoryEngine, Txn, WriteMode};
use crate::{
    error::{DbError, SqlState, TxError},
    scope::{Connection, ConnectionPool, IsolationLevel},
};

const ACTIVE_SQL_TRANSACTION: &str = "25001";
const NO_ACTIVE_SQL_TRANSACTION: &str = "25P01";
const ADMIN_SHUTDOWN: &str = "57P01";

fn db_error(err: EngineError) -> DbError {
    match err {
        EngineError::Conflict { table, key } => DbError::new(
            SqlState::SERIALIZATION_FAILURE,
            format!("could not serialize access due to concurrent update on {table} ({key})"),
        ),
        EngineError::Duplicate { table, key } => DbError::new(
            SqlState::UNIQUE_VIOLATION,
            format!("duplicate key value violates unique constraint \"{table}_pkey\" ({key})"),
        ),
        EngineError::Closed => DbError::new(ADMIN_SHUTDOWN, "terminating connection"),
    }
}

/// Connection pool over a [`MemoryEngine`] with `size` connections.
#[derive(Debug, Clone)]
pub struct MemorySqlPool {
    engine: Arc<MemoryEngine>,
    slots: Arc<Semaphore>,
}

impl MemorySqlPool {
    pub fn new(engine: Arc<MemoryEngine>, size: usize) -> Self {
        Self {
            engine,
            slots: Arc::new(Semaphore::new(size.clamp(1, Semaphore::MAX_PERMITS))),
        }
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }
}

impl ConnectionPool for MemorySqlPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, TxError> {
        if self.engine.is_closed() {
            return Err(TxError::BackendClosed);
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TxError::BackendClosed)?;
        Ok(MemoryConnection {
            engine: self.engine.clone(),
            txn: None,
            failed: false,
            _permit: permit,
        })
    }

    async fn close(&self) -> Result<(), TxError> {
        self.slots.close();
        self.engine.close();
        Ok(())
    }
}

/// A pooled connection. Goes back to the pool on drop, rolling back any open
/// transaction first.
///
/// Like a relational server, a statement error poisons the transaction: every
/// later statement fails with `25P02` until rollback.
#[derive(Debug)]
pub struct MemoryConnection {
    engine: Arc<MemoryEngine>,
    txn: Option<Txn>,
    failed: bool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    fn txn(&mut self) -> Result<&mut Txn, TxError> {
        if self.failed {
            return Err(DbError::new(
                SqlState::IN_FAILED_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            )
            .into());
        }
        self.txn.as_mut().ok_or_else(|| {
            DbError::new(NO_ACTIVE_SQL_TRANSACTION, "there is no transaction in progress").into()
        })
    }

    fn statement<T>(&mut self, result: Result<T, EngineError>) -> Result<T, TxError> {
        result.map_err(|err| {
            self.failed = true;
            db_error(err).into()
        })
    }

    pub fn insert(&mut self, table: &str, key: &str, row: Value) -> Result<(), TxError> {
        let engine = self.engine.clone();
        let result = engine.write(self.txn()?, table, key, row, WriteMode::Insert);
        self.statement(result)
    }

    pub fn select(&mut self, table: &str, key: &str) -> Result<Option<Value>, TxError> {
        let engine = self.engine.clone();
        Ok(engine.read(self.txn()?, table, key))
    }

    /// `INSERT .. ON CONFLICT DO UPDATE` computed from the current row.
    pub fn upsert_with<F>(&mut self, table: &str, key: &str, f: F) -> Result<Value, TxError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let engine = self.engine.clone();
        let result = engine.update_with(self.txn()?, table, key, f);
        self.statement(result)
    }

    /// `TABLESAMPLE` of one row.
    pub fn sample(&mut self, table: &str) -> Result<Option<(String, Value)>, TxError> {
        self.txn()?;
        Ok(self.engine.sample(table))
    }
}

impl Connection for MemoryConnection {
    async fn begin(&mut self, _isolation: IsolationLevel) -> Result<(), TxError> {
        if self.txn.is_some() {
            return Err(DbError::new(
                ACTIVE_SQL_TRANSACTION,
                "there is already a transaction in progress",
            )
            .into());
        }
        let txn = self.engine.begin().map_err(db_error)?;
        self.txn = Some(txn);
        self.failed = false;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TxError> {
        if self.failed {
            // the transaction is poisoned; make the caller roll back
            return Err(DbError::new(
                SqlState::IN_FAILED_TRANSACTION,
                "current transaction is aborted, commit not possible",
            )
            .into());
        }
        let mut txn = self.txn.take().ok_or_else(|| {
            TxError::from(DbError::new(
                NO_ACTIVE_SQL_TRANSACTION,
                "there is no transaction in progress",
            ))
        })?;
        if let Err(err) = self.engine.commit(&mut txn) {
            self.engine.rollback(&mut txn);
            return Err(db_error(err).into());
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TxError> {
        if let Some(mut txn) = self.txn.take() {
            self.engine.rollback(&mut txn);
        }
        self.failed = false;
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(mut txn) = self.txn.take() {
            self.engine.rollback(&mut txn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        classify::{Verdict, classify},
        scope::{Backend, BackendKind, ConnectionBackend, TransactionScope, TxOptions},
    };

    fn backend(size: usize) -> ConnectionBackend<MemorySqlPool> {
        let pool = MemorySqlPool::new(Arc::new(MemoryEngine::new()), size);
        ConnectionBackend::new(pool, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn conflict_reports_serialization_failure() {
        let backend = backend(2);
        let mut a = backend.begin(&TxOptions::default()).await.unwrap();
        let mut b = backend.begin(&TxOptions::default()).await.unwrap();

        a.connection()
            .unwrap()
            .upsert_with("audit", "s1", |_| json!(1))
            .unwrap();
        let err = b
            .connection()
            .unwrap()
            .upsert_with("audit", "s1", |_| json!(1))
            .unwrap_err();
        assert_eq!(err.status_code().as_deref(), Some("40001"));
        assert_eq!(classify(&err, BackendKind::Connection), Verdict::Retryable);

        // poisoned until rollback
        let err = b.connection().unwrap().select("audit", "s1").unwrap_err();
        assert_eq!(err.status_code().as_deref(), Some("25P02"));
        assert!(b.commit().await.is_err());
        b.abort().await.unwrap();

        a.commit().await.unwrap();
        assert_eq!(backend.pool().engine().row_count("audit"), 1);
        assert_eq!(backend.pool().engine().open_transactions(), 0);
    }

    #[tokio::test]
    async fn pool_exhaustion_is_an_acquisition_error() {
        let backend = backend(1);
        let _held = backend.begin(&TxOptions::default()).await.unwrap();
        let err = backend.begin(&TxOptions::default()).await.err().unwrap();
        assert!(matches!(err, TxError::Acquisition(_)));
        assert_eq!(classify(&err, BackendKind::Connection), Verdict::Fatal);
    }

    #[tokio::test]
    async fn closed_pool_refuses_connections() {
        let backend = backend(1);
        backend.close().await.unwrap();
        let err = backend.begin(&TxOptions::default()).await.err().unwrap();
        assert!(matches!(err, TxError::BackendClosed));
    }

    #[tokio::test]
    async fn oversized_pool_is_capped() {
        let backend = backend(usize::MAX);
        let scope = backend.begin(&TxOptions::default()).await.unwrap();
        drop(scope);
        assert_eq!(backend.pool().engine().open_transactions(), 0);
    }
}
