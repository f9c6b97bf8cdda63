use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{EngineError, MemoryEngine, Txn, WriteMode};
use crate::{
    classify::TRANSIENT_TRANSACTION_ERROR,
    error::{CommandError, TxError},
    scope::{ClientSession, SessionClient, TxOptions},
};

const WRITE_CONFLICT: i32 = 112;
const NO_SUCH_TRANSACTION: i32 = 251;
const TRANSACTION_IN_PROGRESS: i32 = 256;
const DUPLICATE_KEY: i32 = 11000;
const CLIENT_CLOSED: i32 = 6;

fn command_error(err: EngineError) -> TxError {
    let err = match err {
        EngineError::Conflict { table, key } => CommandError::new(
            WRITE_CONFLICT,
            "WriteConflict",
            format!("write conflict on {table}.{key}"),
        )
        .with_label(TRANSIENT_TRANSACTION_ERROR),
        EngineError::Duplicate { table, key } => CommandError::new(
            DUPLICATE_KEY,
            "DuplicateKey",
            format!("duplicate key {key} in collection {table}"),
        ),
        EngineError::Closed => CommandError::new(CLIENT_CLOSED, "HostUnreachable", "client closed"),
    };
    err.into()
}

fn no_transaction() -> TxError {
    CommandError::new(
        NO_SUCH_TRANSACTION,
        "NoSuchTransaction",
        "no transaction in progress on this session",
    )
    .into()
}

/// Document client over a [`MemoryEngine`], bounded to `max_sessions` live sessions.
#[derive(Debug, Clone)]
pub struct MemoryDocClient {
    engine: Arc<MemoryEngine>,
    sessions: Arc<Semaphore>,
}

impl MemoryDocClient {
    pub fn new(engine: Arc<MemoryEngine>, max_sessions: usize) -> Self {
        Self {
            engine,
            sessions: Arc::new(Semaphore::new(max_sessions.clamp(1, Semaphore::MAX_PERMITS))),
        }
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }
}

impl SessionClient for MemoryDocClient {
    type Session = MemorySession;

    async fn start_session(&self, causal_consistency: bool) -> Result<MemorySession, TxError> {
        if self.engine.is_closed() {
            return Err(TxError::BackendClosed);
        }
        let permit = self
            .sessions
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TxError::BackendClosed)?;
        Ok(MemorySession {
            engine: self.engine.clone(),
            txn: None,
            causal_consistency,
            _permit: permit,
        })
    }

    async fn close(&self) -> Result<(), TxError> {
        self.sessions.close();
        self.engine.close();
        Ok(())
    }
}

/// A session on the in-memory document store.
///
/// Data operations are only valid inside a transaction. Dropping the session
/// aborts whatever transaction is still running, as ending a server session does.
#[derive(Debug)]
pub struct MemorySession {
    engine: Arc<MemoryEngine>,
    txn: Option<Txn>,
    causal_consistency: bool,
    _permit: OwnedSemaphorePermit,
}

impl MemorySession {
    pub fn is_causally_consistent(&self) -> bool {
        self.causal_consistency
    }

    fn txn(&mut self) -> Result<&mut Txn, TxError> {
        self.txn.as_mut().ok_or_else(no_transaction)
    }

    pub fn insert_one(&mut self, collection: &str, id: &str, doc: Value) -> Result<(), TxError> {
        let engine = self.engine.clone();
        engine
            .write(self.txn()?, collection, id, doc, WriteMode::Insert)
            .map_err(command_error)
    }

    pub fn find_one(&mut self, collection: &str, id: &str) -> Result<Option<Value>, TxError> {
        let engine = self.engine.clone();
        Ok(engine.read(self.txn()?, collection, id))
    }

    /// Update-or-insert of one document, computed from its current value.
    pub fn upsert_with<F>(&mut self, collection: &str, id: &str, f: F) -> Result<Value, TxError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let engine = self.engine.clone();
        engine
            .update_with(self.txn()?, collection, id, f)
            .map_err(command_error)
    }

    /// `$sample` of size one.
    pub fn sample(&mut self, collection: &str) -> Result<Option<(String, Value)>, TxError> {
        self.txn()?;
        Ok(self.engine.sample(collection))
    }
}

impl ClientSession for MemorySession {
    fn start_transaction(&mut self, _options: &TxOptions) -> Result<(), TxError> {
        if self.txn.is_some() {
            return Err(CommandError::new(
                TRANSACTION_IN_PROGRESS,
                "TransactionInProgress",
                "a transaction is already in progress on this session",
            )
            .into());
        }
        self.txn = Some(self.engine.begin().map_err(command_error)?);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), TxError> {
        let mut txn = self.txn.take().ok_or_else(no_transaction)?;
        match self.engine.commit(&mut txn) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.engine.rollback(&mut txn);
                Err(command_error(err))
            }
        }
    }

    async fn abort_transaction(&mut self) -> Result<(), TxError> {
        let mut txn = self.txn.take().ok_or_else(no_transaction)?;
        self.engine.rollback(&mut txn);
        Ok(())
    }
}

impl Drop for MemorySession {
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
        scope::{Backend, BackendKind, ScopeState, SessionBackend, TransactionScope},
    };

    fn backend(max_sessions: usize) -> SessionBackend<MemoryDocClient> {
        let client = MemoryDocClient::new(Arc::new(MemoryEngine::new()), max_sessions);
        SessionBackend::new(client, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn write_conflict_is_labeled_transient() {
        let backend = backend(2);
        let mut a = backend.begin(&TxOptions::default()).await.unwrap();
        let mut b = backend.begin(&TxOptions::default()).await.unwrap();

        a.session()
            .unwrap()
            .upsert_with("audit", "s1", |_| json!(1))
            .unwrap();
        let err = b
            .session()
            .unwrap()
            .upsert_with("audit", "s1", |_| json!(1))
            .unwrap_err();

        assert_eq!(err.status_code().as_deref(), Some("112"));
        assert_eq!(classify(&err, BackendKind::Session), Verdict::Retryable);

        b.abort().await.unwrap();
        a.commit().await.unwrap();
        assert_eq!(a.state(), ScopeState::Committed);
        assert!(matches!(a.commit().await, Err(TxError::ScopeClosed(ScopeState::Committed))));
        assert!(a.session().is_err());
    }

    #[tokio::test]
    async fn duplicate_key_is_fatal() {
        let backend = backend(1);
        let mut scope = backend.begin(&TxOptions::default()).await.unwrap();
        let session = scope.session().unwrap();
        session.insert_one("seat", "1", json!({})).unwrap();
        let err = session.insert_one("seat", "1", json!({})).unwrap_err();
        assert_eq!(classify(&err, BackendKind::Session), Verdict::Fatal);
    }

    #[tokio::test]
    async fn begin_times_out_without_free_session() {
        let backend = backend(1);
        let _held = backend.begin(&TxOptions::default()).await.unwrap();
        let err = backend.begin(&TxOptions::default()).await.err().unwrap();
        assert!(matches!(err, TxError::Acquisition(_)));
    }

    #[tokio::test]
    async fn dropped_scope_rolls_back() {
        let backend = backend(1);
        let engine = backend.client().engine().clone();
        {
            let mut scope = backend.begin(&TxOptions::default()).await.unwrap();
            scope
                .session()
                .unwrap()
                .insert_one("seat", "1", json!({}))
                .unwrap();
            assert_eq!(engine.open_transactions(), 1);
        }
        assert_eq!(engine.open_transactions(), 0);
        assert_eq!(engine.row_count("seat"), 0);
    }
}
