//! The unit of benchmarked work and what each lane hands to it.
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{error::TxError, scope::Backend};

/// A user supplied workload.
///
/// The scenario calls [`setup`](Workload::setup) exactly once before any lane
/// starts, [`iteration`](Workload::iteration) once per attempt from every lane, and
/// [`close`](Workload::close) exactly once after every lane has stopped.
///
/// `iteration` must issue all of its reads and writes through the scope it is
/// given; it must not commit or abort it, the executor does that.
///
/// # Example
/// ```rust
/// use txbench::{LaneContext, Workload, error::TxError};
/// use txbench::memory::{MemoryDocClient, MemorySession};
/// use txbench::scope::{SessionBackend, SessionScope};
/// use serde_json::json;
///
/// struct Counter {
///     backend: SessionBackend<MemoryDocClient>,
/// }
///
/// impl Workload for Counter {
///     type Backend = SessionBackend<MemoryDocClient>;
///
///     fn name(&self) -> &str {
///         "counter"
///     }
///
///     fn backend(&self) -> &Self::Backend {
///         &self.backend
///     }
///
///     async fn iteration(
///         &self,
///         scope: &mut SessionScope<MemorySession>,
///         ctx: &LaneContext,
///     ) -> Result<(), TxError> {
///         let id = ctx.next_id().to_string();
///         scope.session()?.insert_one("users", &id, json!({ "lane": ctx.lane() }))?;
///         Ok(())
///     }
/// }
/// ```
pub trait Workload
where
    Self: Send + Sync + 'static,
{
    type Backend: Backend;

    fn name(&self) -> &str;

    /// The backend scopes are opened on.
    fn backend(&self) -> &Self::Backend;

    /// Prepare shared backend state. Failing here fails the whole run.
    fn setup(&self) -> impl Future<Output = Result<(), TxError>> + Send {
        async { Ok(()) }
    }

    /// One attempt of one logical iteration.
    fn iteration(
        &self,
        scope: &mut <Self::Backend as Backend>::Scope,
        ctx: &LaneContext,
    ) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Release backend handles. Failures are logged, never escalated.
    fn close(&self) -> impl Future<Output = Result<(), TxError>> + Send {
        self.backend().close()
    }
}

/// Run scoped generator of unique synthetic ids, shared by every lane.
///
/// Ids are unique but carry no ordering across lanes.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator(Arc<AtomicU64>);

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        Self(Arc::new(AtomicU64::new(first)))
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// How many ids have been handed out so far (when starting at zero).
    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a lane exposes to the workload on every attempt.
#[derive(Debug, Clone)]
pub struct LaneContext {
    lane: usize,
    attempt: u32,
    ids: IdGenerator,
    operation_delay: Duration,
}

impl LaneContext {
    pub fn new(lane: usize, ids: IdGenerator, operation_delay: Duration) -> Self {
        Self {
            lane,
            attempt: 0,
            ids,
            operation_delay,
        }
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Attempt number within the current logical iteration, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn next_id(&self) -> u64 {
        self.ids.next_id()
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn operation_delay(&self) -> Duration {
        self.operation_delay
    }

    /// Sleep for the configured per-operation artificial delay, if any.
    pub async fn pause(&self) {
        if !self.operation_delay.is_zero() {
            tokio::time::sleep(self.operation_delay).await;
        }
    }
}
