//! Session-scoped transactions.
//!
//! Every operation of the attempt is issued through the same causally consistent
//! session handle. Conflicts surface as [`CommandError`](crate::error::CommandError)s
//! carrying labels such as `TransientTransactionError`.
use std::{future::Future, time::Duration};

use super::{Backend, BackendKind, ScopeState, TransactionScope, TxOptions};
use crate::error::TxError;

/// A session opened on a [`SessionClient`].
pub trait ClientSession
where
    Self: Send + 'static,
{
    /// Start a transaction on this session. Client side only, no round trip.
    fn start_transaction(&mut self, options: &TxOptions) -> Result<(), TxError>;

    fn commit_transaction(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;

    fn abort_transaction(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;
}

/// Client handing out sessions, e.g. a document database driver.
pub trait SessionClient
where
    Self: Send + Sync + 'static,
{
    type Session: ClientSession;

    fn start_session(
        &self,
        causal_consistency: bool,
    ) -> impl Future<Output = Result<Self::Session, TxError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TxError>> + Send {
        async { Ok(()) }
    }
}

/// [`Backend`] over a [`SessionClient`].
pub struct SessionBackend<C> {
    client: C,
    acquire_timeout: Duration,
}

impl<C: SessionClient> SessionBackend<C> {
    pub fn new(client: C, acquire_timeout: Duration) -> Self {
        Self {
            client,
            acquire_timeout,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: SessionClient> Backend for SessionBackend<C> {
    type Scope = SessionScope<C::Session>;

    fn kind(&self) -> BackendKind {
        BackendKind::Session
    }

    async fn begin(&self, options: &TxOptions) -> Result<Self::Scope, TxError> {
        let started = tokio::time::timeout(
            self.acquire_timeout,
            self.client.start_session(options.causal_consistency),
        )
        .await;
        let mut session = match started {
            Ok(session) => session?,
            Err(_) => return Err(TxError::Acquisition(self.acquire_timeout)),
        };
        session.start_transaction(options)?;
        Ok(SessionScope {
            session,
            state: ScopeState::Open,
        })
    }

    async fn close(&self) -> Result<(), TxError> {
        self.client.close().await
    }
}

/// One transaction on one session.
pub struct SessionScope<S> {
    session: S,
    state: ScopeState,
}

impl<S: ClientSession> SessionScope<S> {
    /// The session every read and write of this attempt must go through.
    pub fn session(&mut self) -> Result<&mut S, TxError> {
        self.ensure_open()?;
        Ok(&mut self.session)
    }
}

impl<S: ClientSession> TransactionScope for SessionScope<S> {
    fn state(&self) -> ScopeState {
        self.state
    }

    async fn commit(&mut self) -> Result<(), TxError> {
        self.ensure_open()?;
        self.session.commit_transaction().await?;
        self.state = ScopeState::Committed;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), TxError> {
        self.ensure_open()?;
        self.state = ScopeState::Aborted;
        self.session.abort_transaction().await
    }
}
