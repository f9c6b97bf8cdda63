//! Retry classification.
//!
//! Decides whether a failed attempt hit a transient conflict (worth re-running
//! unchanged) or something fatal. The decision is table driven and keyed by
//! [`BackendKind`], so workloads never carry their own copy of the rules.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{error::TxError, scope::BackendKind};

/// Label attached to errors of a transaction that can be retried from the start.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Label attached when the outcome of a commit is unknown.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Retryable,
    Fatal,
}

/// What makes an error retryable for one backend kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationTable {
    /// Any of these command error labels makes the error retryable.
    pub labels: BTreeSet<String>,
    /// Any of these SQLSTATEs makes the error retryable.
    pub sqlstates: BTreeSet<String>,
}

impl ClassificationTable {
    pub fn session_default() -> Self {
        Self {
            labels: [TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT]
                .into_iter()
                .map(String::from)
                .collect(),
            sqlstates: BTreeSet::new(),
        }
    }

    pub fn connection_default() -> Self {
        Self {
            labels: BTreeSet::new(),
            sqlstates: [crate::error::SqlState::SERIALIZATION_FAILURE]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Table driven classifier. Pure: the same error and kind always give the same verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryClassifier {
    tables: BTreeMap<BackendKind, ClassificationTable>,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(BackendKind::Session, ClassificationTable::session_default());
        tables.insert(
            BackendKind::Connection,
            ClassificationTable::connection_default(),
        );
        Self { tables }
    }
}

impl RetryClassifier {
    /// Also treat errors carrying `label` as retryable on session backends.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.tables
            .entry(BackendKind::Session)
            .or_default()
            .labels
            .insert(label.into());
        self
    }

    /// Also treat `sqlstate` as retryable on connection backends.
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.tables
            .entry(BackendKind::Connection)
            .or_default()
            .sqlstates
            .insert(sqlstate.into());
        self
    }

    pub fn table(&self, kind: BackendKind) -> Option<&ClassificationTable> {
        self.tables.get(&kind)
    }

    pub fn classify(&self, error: &TxError, kind: BackendKind) -> Verdict {
        let Some(table) = self.tables.get(&kind) else {
            return Verdict::Fatal;
        };
        match (kind, error) {
            (BackendKind::Session, TxError::Command(e)) => {
                if e.labels.iter().any(|l| table.labels.contains(l)) {
                    Verdict::Retryable
                } else {
                    Verdict::Fatal
                }
            }
            (BackendKind::Connection, TxError::Database(e)) => {
                if table.sqlstates.contains(e.sqlstate.code()) {
                    Verdict::Retryable
                } else {
                    Verdict::Fatal
                }
            }
            (_, TxError::Acquisition(_) | TxError::RetriesExhausted { .. }) => Verdict::Fatal,
            (kind, other) => {
                tracing::warn!(%kind, error = %other, "unclassifiable error, treating as fatal");
                Verdict::Fatal
            }
        }
    }
}

/// Classify with the default tables.
pub fn classify(error: &TxError, kind: BackendKind) -> Verdict {
    RetryClassifier::default().classify(error, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandError, DbError, SqlState};
    use proptest::prelude::*;

    fn labeled(label: &str) -> TxError {
        CommandError::new(112, "WriteConflict", "conflict")
            .with_label(label)
            .into()
    }

    #[test]
    fn session_labels_are_retryable() {
        assert_eq!(
            classify(&labeled(TRANSIENT_TRANSACTION_ERROR), BackendKind::Session),
            Verdict::Retryable
        );
        assert_eq!(
            classify(
                &labeled(UNKNOWN_TRANSACTION_COMMIT_RESULT),
                BackendKind::Session
            ),
            Verdict::Retryable
        );
    }

    #[test]
    fn session_error_without_label_is_fatal() {
        let err = CommandError::new(11000, "DuplicateKey", "dup").into();
        assert_eq!(classify(&err, BackendKind::Session), Verdict::Fatal);
    }

    #[test]
    fn only_serialization_failure_is_retryable_by_default() {
        let conflict = DbError::new(SqlState::SERIALIZATION_FAILURE, "could not serialize").into();
        assert_eq!(
            classify(&conflict, BackendKind::Connection),
            Verdict::Retryable
        );

        for code in [
            SqlState::DEADLOCK_DETECTED,
            SqlState::LOCK_NOT_AVAILABLE,
            SqlState::UNIQUE_VIOLATION,
        ] {
            let err = DbError::new(code, "nope").into();
            assert_eq!(classify(&err, BackendKind::Connection), Verdict::Fatal);
        }
    }

    #[test]
    fn opt_in_sqlstates() {
        let classifier = RetryClassifier::default().with_sqlstate(SqlState::DEADLOCK_DETECTED);
        let err = DbError::new(SqlState::DEADLOCK_DETECTED, "deadlock").into();
        assert_eq!(
            classifier.classify(&err, BackendKind::Connection),
            Verdict::Retryable
        );
    }

    #[test]
    fn errors_from_the_other_model_are_fatal() {
        assert_eq!(
            classify(&labeled(TRANSIENT_TRANSACTION_ERROR), BackendKind::Connection),
            Verdict::Fatal
        );
        let conflict = DbError::new(SqlState::SERIALIZATION_FAILURE, "conflict").into();
        assert_eq!(classify(&conflict, BackendKind::Session), Verdict::Fatal);
    }

    #[test]
    fn workload_and_acquisition_errors_are_fatal() {
        let err = TxError::Workload(anyhow::anyhow!("bad input"));
        assert_eq!(classify(&err, BackendKind::Session), Verdict::Fatal);
        let err = TxError::Acquisition(std::time::Duration::from_millis(5));
        assert_eq!(classify(&err, BackendKind::Connection), Verdict::Fatal);
    }

    proptest! {
        #[test]
        fn classification_is_idempotent(
            code in "[0-9A-Z]{5}",
            label in prop::sample::select(vec![
                TRANSIENT_TRANSACTION_ERROR,
                UNKNOWN_TRANSACTION_COMMIT_RESULT,
                "NoWritesPerformed",
                "RetryableWriteError",
            ]),
        ) {
            let classifier = RetryClassifier::default();
            let sql: TxError = DbError::new(&code, "x").into();
            let doc = labeled(label);
            for kind in [BackendKind::Session, BackendKind::Connection] {
                prop_assert_eq!(classifier.classify(&sql, kind), classifier.classify(&sql, kind));
                prop_assert_eq!(classifier.classify(&doc, kind), classifier.classify(&doc, kind));
            }
        }
    }
}
