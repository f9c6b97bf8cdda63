//! Error types shared by the engine, the transaction scopes and the workloads.
//!
//! Backend failures are kept structured (labels, SQLSTATEs) so the
//! [`RetryClassifier`](crate::classify::RetryClassifier) can decide whether an
//! attempt should be re-run without string matching.

use std::{collections::BTreeSet, fmt, time::Duration};

use thiserror::Error;

use crate::scope::ScopeState;

/// A command error reported by a session-scoped (document) backend.
///
/// Mirrors the shape document databases use: a numeric code, a code name and a
/// set of error labels attached by the server or driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: BTreeSet<String>,
}

impl CommandError {
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            labels: BTreeSet::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code_name, self.code, self.message)?;
        if !self.labels.is_empty() {
            let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
            write!(f, " [{}]", labels.join(", "))?;
        }
        Ok(())
    }
}

/// A five character SQLSTATE code as reported by relational backends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SqlState(String);

impl SqlState {
    /// `40001`
    pub const SERIALIZATION_FAILURE: &'static str = "40001";
    /// `40P01`
    pub const DEADLOCK_DETECTED: &'static str = "40P01";
    /// `55P03`
    pub const LOCK_NOT_AVAILABLE: &'static str = "55P03";
    /// `23505`
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    /// `25P02`
    pub const IN_FAILED_TRANSACTION: &'static str = "25P02";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An error reported by a connection-scoped (relational) backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub sqlstate: SqlState,
    pub message: String,
}

impl DbError {
    pub fn new(sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            sqlstate: SqlState::new(sqlstate),
            message: message.into(),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.sqlstate, self.message)
    }
}

/// Every failure an attempt can run into.
#[derive(Debug, Error)]
pub enum TxError {
    /// No backend handle became available within the bounded wait.
    #[error("no backend handle available within {0:?}")]
    Acquisition(Duration),

    /// Session-scoped backend error.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// Connection-scoped backend error.
    #[error("database error: {0}")]
    Database(DbError),

    /// The scope already reached a terminal state.
    #[error("transaction scope is already {0}")]
    ScopeClosed(ScopeState),

    /// The backend has been closed.
    #[error("backend is closed")]
    BackendClosed,

    /// Every allowed attempt of one logical iteration failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<TxError> },

    /// Anything raised by workload logic itself.
    #[error(transparent)]
    Workload(#[from] anyhow::Error),
}

impl TxError {
    /// The backend status code carried by this error, if any.
    ///
    /// Used to annotate fatal failures in reports.
    pub fn status_code(&self) -> Option<String> {
        match self {
            TxError::Command(e) => Some(e.code.to_string()),
            TxError::Database(e) => Some(e.sqlstate.to_string()),
            TxError::RetriesExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }
}

impl From<CommandError> for TxError {
    fn from(value: CommandError) -> Self {
        TxError::Command(value)
    }
}

impl From<DbError> for TxError {
    fn from(value: DbError) -> Self {
        TxError::Database(value)
    }
}

/// Errors that end a whole run before or outside the lanes.
#[derive(Debug, Error)]
pub enum RunError {
    /// `setup` failed; no iteration was executed.
    #[error("setup of workload '{workload}' failed: {source}")]
    Setup {
        workload: String,
        #[source]
        source: TxError,
    },

    /// The executor itself failed.
    #[error("executor failed: {0}")]
    Executor(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A [`RunConfig`](crate::config::RunConfig) that cannot describe a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_display_lists_labels() {
        let err = CommandError::new(112, "WriteConflict", "write conflict on seat")
            .with_label("TransientTransactionError");
        assert_eq!(
            err.to_string(),
            "WriteConflict (112): write conflict on seat [TransientTransactionError]"
        );
    }

    #[test]
    fn status_code_follows_exhausted_retries() {
        let err = TxError::RetriesExhausted {
            attempts: 3,
            last: Box::new(DbError::new(SqlState::SERIALIZATION_FAILURE, "conflict").into()),
        };
        assert_eq!(err.status_code().as_deref(), Some("40001"));
        assert_eq!(TxError::Acquisition(Duration::from_secs(1)).status_code(), None);
    }
}
