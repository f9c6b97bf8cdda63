//! Transaction scopes, each one in-flight transactional attempt against a backend.
//!
//! Two transactional models are unified behind the same capability set:
//!
//! - [`session`]: a causally consistent session where every read and write goes
//!   through one session handle and conflicts surface as labeled command errors.
//! - [`connection`]: one connection per scope with explicit commit/rollback where
//!   conflicts surface as SQLSTATE codes on any statement or on commit.
//!
//! A [`Backend`] hands out scopes; the executor drives each scope through
//! `begin → (workload) → commit | abort`. Scopes are owned by a single lane and are
//! never reused once they reach a terminal [`ScopeState`].
pub mod connection;
pub mod session;

pub use connection::{Connection, ConnectionBackend, ConnectionPool, ConnectionScope};
pub use session::{ClientSession, SessionBackend, SessionClient, SessionScope};

use std::{fmt, future::Future};

use serde::{Deserialize, Serialize};

use crate::error::TxError;

/// Which transactional model a backend speaks. Drives retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Session-scoped, multi-document transactions.
    Session,
    /// Connection-scoped, relational transactions.
    Connection,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Session => f.write_str("session"),
            BackendKind::Connection => f.write_str("connection"),
        }
    }
}

/// Lifecycle of a scope. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Committed,
    Aborted,
}

impl ScopeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ScopeState::Open)
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeState::Open => f.write_str("open"),
            ScopeState::Committed => f.write_str("committed"),
            ScopeState::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    Acknowledged,
    #[default]
    Majority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConcern {
    Local,
    #[default]
    Snapshot,
}

/// Consistency and isolation options forwarded untouched into [`Backend::begin`].
///
/// Each backend picks the fields that make sense for its model: session backends
/// read the concerns and `causal_consistency`, connection backends read `isolation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub write_concern: WriteConcern,
    pub read_concern: ReadConcern,
    pub causal_consistency: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            write_concern: WriteConcern::default(),
            read_concern: ReadConcern::default(),
            causal_consistency: true,
        }
    }
}

/// A storage backend able to open transaction scopes.
pub trait Backend
where
    Self: Send + Sync + 'static,
{
    type Scope: TransactionScope;

    /// Which classification table applies to errors raised through this backend.
    fn kind(&self) -> BackendKind;

    /// Acquire exclusive use of one handle and start a transaction on it.
    ///
    /// Fails with [`TxError::Acquisition`] if no handle is available within the
    /// backend's bounded wait.
    fn begin(
        &self,
        options: &TxOptions,
    ) -> impl Future<Output = Result<Self::Scope, TxError>> + Send;

    /// Release backend handles. Called once, after every lane has stopped.
    fn close(&self) -> impl Future<Output = Result<(), TxError>> + Send {
        async { Ok(()) }
    }
}

/// Exactly one physical transaction.
pub trait TransactionScope
where
    Self: Send + 'static,
{
    fn state(&self) -> ScopeState;

    /// Finalize every write issued through this scope.
    ///
    /// On success the scope is `Committed`. On failure it stays `Open` and the
    /// backend error is returned unchanged so it can be classified.
    fn commit(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Discard every write issued through this scope.
    ///
    /// The scope is `Aborted` afterwards whatever the backend answered; an error
    /// only reports that the backend could not confirm the rollback.
    fn abort(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Fails with [`TxError::ScopeClosed`] unless the scope is still open.
    fn ensure_open(&self) -> Result<(), TxError> {
        match self.state() {
            ScopeState::Open => Ok(()),
            state => Err(TxError::ScopeClosed(state)),
        }
    }
}
