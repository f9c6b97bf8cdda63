//! Connection-scoped transactions.
//!
//! A scope owns one pooled connection for its whole lifetime. Commit and rollback
//! are explicit and conflicts surface as SQLSTATE codes, either on a statement or
//! on commit.
use std::{future::Future, time::Duration};

use super::{Backend, BackendKind, IsolationLevel, ScopeState, TransactionScope, TxOptions};
use crate::error::TxError;

/// A single pooled connection with manual transaction control.
pub trait Connection
where
    Self: Send + 'static,
{
    /// Turn autocommit off and open a transaction with the given isolation.
    fn begin(
        &mut self,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Result<(), TxError>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;
}

/// Pool of [`Connection`]s.
pub trait ConnectionPool
where
    Self: Send + Sync + 'static,
{
    type Connection: Connection;

    /// Wait for a free connection. The caller bounds the wait.
    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, TxError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TxError>> + Send {
        async { Ok(()) }
    }
}

/// [`Backend`] over a [`ConnectionPool`].
pub struct ConnectionBackend<P> {
    pool: P,
    acquire_timeout: Duration,
}

impl<P: ConnectionPool> ConnectionBackend<P> {
    pub fn new(pool: P, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }
}

impl<P: ConnectionPool> Backend for ConnectionBackend<P> {
    type Scope = ConnectionScope<P::Connection>;

    fn kind(&self) -> BackendKind {
        BackendKind::Connection
    }

    async fn begin(&self, options: &TxOptions) -> Result<Self::Scope, TxError> {
        let acquired = tokio::time::timeout(self.acquire_timeout, self.pool.acquire()).await;
        let mut connection = match acquired {
            Ok(connection) => connection?,
            Err(_) => return Err(TxError::Acquisition(self.acquire_timeout)),
        };
        connection.begin(options.isolation).await?;
        Ok(ConnectionScope {
            connection,
            state: ScopeState::Open,
        })
    }

    async fn close(&self) -> Result<(), TxError> {
        self.pool.close().await
    }
}

/// One transaction on one connection. The connection returns to its pool on drop.
pub struct ConnectionScope<C> {
    connection: C,
    state: ScopeState,
}

impl<C: Connection> ConnectionScope<C> {
    /// The connection every statement of this attempt must be issued on.
    pub fn connection(&mut self) -> Result<&mut C, TxError> {
        self.ensure_open()?;
        Ok(&mut self.connection)
    }
}

impl<C: Connection> TransactionScope for ConnectionScope<C> {
    fn state(&self) -> ScopeState {
        self.state
    }

    async fn commit(&mut self) -> Result<(), TxError> {
        self.ensure_open()?;
        self.connection.commit().await?;
        self.state = ScopeState::Committed;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), TxError> {
        self.ensure_open()?;
        self.state = ScopeState::Aborted;
        self.connection.rollback().await
    }
}
