//! Executor: orchestration of the lanes that run a `Scenario`
//!
//! The `Executor` trait is the runtime that executes a `Scenario`. txbench ships
//! [`LaneExecutor`], a fixed pool of concurrent lanes where each lane runs logical
//! iterations strictly one after another:
//!
//! ```text
//! begin scope → workload.iteration(scope) → commit
//!      ↑                 │ failure
//!      └── retry ── classify → fatal: abort, record, stop lane
//! ```
//!
//! # Budget
//! A run stops admitting iterations when its [`Budget`] is spent: a total
//! iteration count shared by every lane, a wall-clock duration, or both. Retried
//! attempts never consume budget; only logical iterations do.
//!
//! # Cancellation
//! A [`Cancellation`] handle (or the duration budget running out) stops lanes
//! from starting new iterations. Attempts already in flight always reach commit or
//! abort; nothing is torn down from outside a lane.
pub mod lanes;
pub use lanes::LaneExecutor;

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{aggregate::Aggregate, error::TxError, scenario::Scenario, workload::Workload};

/// The runtime hook that executes a `Scenario`.
///
/// Implementations decide how lanes are scheduled; they must call the workload's
/// `iteration` only, `setup` and `close` belong to the scenario.
pub trait Executor<W, A>
where
    Self: Send + Sync + Sized,
    W: Workload,
    A: Aggregate,
{
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute the scenario and return the run summary.
    fn exec(
        &self,
        scenario: &Scenario<W, Self, A>,
    ) -> impl Future<Output = Result<RunSummary<A>, Self::Error>> + Send;
}

/// How much work a run may admit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Total logical iterations across all lanes.
    pub iterations: Option<u64>,
    /// Wall-clock limit after which no new iteration starts.
    pub duration: Option<Duration>,
}

impl Budget {
    pub fn count(iterations: u64) -> Self {
        Self {
            iterations: Some(iterations),
            duration: None,
        }
    }

    pub fn timed(duration: Duration) -> Self {
        Self {
            iterations: None,
            duration: Some(duration),
        }
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Runs until cancelled.
    pub fn is_unbounded(&self) -> bool {
        self.iterations.is_none() && self.duration.is_none()
    }
}

/// Run level cancellation signal.
///
/// Cloning shares the signal. Cancelling is idempotent and can happen before the
/// run starts, in which case no iteration is admitted.
#[derive(Debug, Clone)]
pub struct Cancellation(Arc<watch::Sender<bool>>);

impl Default for Cancellation {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// The fatal error that stopped one lane.
#[derive(Debug)]
pub struct LaneFailure {
    pub lane: usize,
    pub error: TxError,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunSummary<A> {
    pub scenario: String,
    pub lanes: usize,
    pub aggregate: A,
    pub elapsed: Duration,
    /// Cancellation was requested while the run was going.
    pub cancelled: bool,
    pub lane_failures: Vec<LaneFailure>,
}

impl<A> RunSummary<A> {
    /// False as soon as one lane stopped on a fatal error, even if others succeeded.
    pub fn is_success(&self) -> bool {
        self.lane_failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_by_clones() {
        let cancellation = Cancellation::new();
        let other = cancellation.clone();
        let rx = cancellation.subscribe();
        assert!(!other.is_cancelled());

        other.cancel();
        assert!(cancellation.is_cancelled());
        assert!(*rx.borrow());
    }

    #[test]
    fn budget_builders() {
        let budget = Budget::count(10).with_duration(Duration::from_secs(1));
        assert_eq!(budget.iterations, Some(10));
        assert_eq!(budget.duration, Some(Duration::from_secs(1)));
        assert!(Budget::default().is_unbounded());
    }
}
