use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TxError;

/// Result of one attempt: one execution of the iteration body inside one scope.
///
/// Produced fresh for every attempt and never shared between lanes.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The scope committed. Carries the latency of this attempt alone.
    Success(Duration),
    /// Transient conflict; the same logical iteration may run again.
    Retryable(TxError),
    /// Anything that must not be retried.
    Fatal(TxError),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }
}

/// How a logical iteration ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IterationStatus {
    Committed,
    /// Fatal failure, or retries exhausted.
    Failed {
        cause: String,
        /// Backend status code (SQLSTATE or command code) when there is one.
        code: Option<String>,
    },
    /// Cancellation arrived while the iteration waited to be re-attempted.
    Abandoned,
}

/// An `IterationMetric` is the single sample a lane records per logical iteration.
///
/// Retried attempts fold into the same sample: `latency` spans from the first
/// `begin` to the terminal commit or the final abort, and `attempts` counts every
/// attempt made, the successful one included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationMetric {
    pub lane: usize,
    pub attempts: u32,
    pub latency: Duration,
    #[serde(flatten)]
    pub status: IterationStatus,
}

impl IterationMetric {
    pub fn committed(lane: usize, attempts: u32, latency: Duration) -> Self {
        Self {
            lane,
            attempts,
            latency,
            status: IterationStatus::Committed,
        }
    }

    pub fn failed(lane: usize, attempts: u32, latency: Duration, error: &TxError) -> Self {
        Self {
            lane,
            attempts,
            latency,
            status: IterationStatus::Failed {
                cause: error.to_string(),
                code: error.status_code(),
            },
        }
    }

    pub fn abandoned(lane: usize, attempts: u32, latency: Duration) -> Self {
        Self {
            lane,
            attempts,
            latency,
            status: IterationStatus::Abandoned,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.status, IterationStatus::Committed)
    }

    /// Attempts beyond the first one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}
