//! A backend and workload whose behavior each test scripts.
#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use txbench::{
    LaneContext, LaneExecutor, Scenario, Workload,
    aggregate::RunAggregate,
    error::{DbError, RunError, SqlState, TxError},
    executor::{Cancellation, RunSummary},
    scope::{Backend, BackendKind, ScopeState, TransactionScope, TxOptions},
};

#[derive(Debug, Default)]
pub struct Counters {
    pub open: AtomicUsize,
    pub max_open: AtomicUsize,
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
    pub closes: AtomicUsize,
    pub setups: AtomicUsize,
    /// Attempts the workload body started.
    pub iterations: AtomicU64,
    /// Ids written by committed scopes.
    pub committed_ids: Mutex<Vec<u64>>,
    /// Makes every rollback report a lost connection after finishing the scope.
    pub fail_abort: AtomicBool,
    pub fail_close: AtomicBool,
}

impl Counters {
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBackend {
    kind: BackendKind,
    handles: Arc<Semaphore>,
    acquire_timeout: Duration,
    pub counters: Arc<Counters>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, handles: usize) -> Self {
        Self {
            kind,
            handles: Arc::new(Semaphore::new(handles)),
            acquire_timeout: Duration::from_millis(20),
            counters: Arc::default(),
        }
    }
}

impl Backend for ScriptedBackend {
    type Scope = ScriptedScope;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn begin(&self, _options: &TxOptions) -> Result<ScriptedScope, TxError> {
        let acquired =
            tokio::time::timeout(self.acquire_timeout, self.handles.clone().acquire_owned()).await;
        let permit = match acquired {
            Ok(permit) => permit.map_err(|_| TxError::BackendClosed)?,
            Err(_) => return Err(TxError::Acquisition(self.acquire_timeout)),
        };
        let counters = self.counters.clone();
        counters.begins.fetch_add(1, Ordering::SeqCst);
        let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(ScriptedScope {
            counters,
            state: ScopeState::Open,
            staged: Vec::new(),
            _permit: permit,
        })
    }

    async fn close(&self) -> Result<(), TxError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.handles.close();
        if self.counters.fail_close.load(Ordering::SeqCst) {
            return Err(TxError::BackendClosed);
        }
        Ok(())
    }
}

pub struct ScriptedScope {
    counters: Arc<Counters>,
    state: ScopeState,
    staged: Vec<u64>,
    _permit: OwnedSemaphorePermit,
}

impl ScriptedScope {
    pub fn write(&mut self, id: u64) -> Result<(), TxError> {
        self.ensure_open()?;
        self.staged.push(id);
        Ok(())
    }

    fn finish(&mut self, state: ScopeState) {
        self.state = state;
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransactionScope for ScriptedScope {
    fn state(&self) -> ScopeState {
        self.state
    }

    async fn commit(&mut self) -> Result<(), TxError> {
        self.ensure_open()?;
        self.counters
            .committed_ids
            .lock()
            .extend(self.staged.drain(..));
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.finish(ScopeState::Committed);
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), TxError> {
        self.ensure_open()?;
        self.staged.clear();
        self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        self.finish(ScopeState::Aborted);
        if self.counters.fail_abort.load(Ordering::SeqCst) {
            return Err(DbError::new("08006", "connection lost during rollback").into());
        }
        Ok(())
    }
}

impl Drop for ScriptedScope {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

type Script = Box<dyn Fn(&LaneContext) -> Result<(), TxError> + Send + Sync>;

/// Writes one fresh id per attempt, then fails however the script says.
pub struct ScriptedWorkload {
    backend: ScriptedBackend,
    script: Script,
    pub fail_setup: bool,
    pub pause: Option<Duration>,
}

impl ScriptedWorkload {
    pub fn new(backend: ScriptedBackend) -> Self {
        Self::scripted(backend, |_| Ok(()))
    }

    pub fn scripted<F>(backend: ScriptedBackend, script: F) -> Self
    where
        F: Fn(&LaneContext) -> Result<(), TxError> + Send + Sync + 'static,
    {
        Self {
            backend,
            script: Box::new(script),
            fail_setup: false,
            pause: None,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.backend.counters.clone()
    }
}

impl Workload for ScriptedWorkload {
    type Backend = ScriptedBackend;

    fn name(&self) -> &str {
        "scripted"
    }

    fn backend(&self) -> &ScriptedBackend {
        &self.backend
    }

    async fn setup(&self) -> Result<(), TxError> {
        self.backend.counters.setups.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(TxError::Workload(anyhow::anyhow!("schema missing")));
        }
        Ok(())
    }

    async fn iteration(&self, scope: &mut ScriptedScope, ctx: &LaneContext) -> Result<(), TxError> {
        self.backend.counters.iterations.fetch_add(1, Ordering::SeqCst);
        scope.write(ctx.next_id())?;
        if let Some(pause) = self.pause {
            tokio::time::sleep(pause).await;
        }
        (self.script)(ctx)
    }
}

pub fn serialization_failure() -> TxError {
    DbError::new(SqlState::SERIALIZATION_FAILURE, "could not serialize access").into()
}

pub async fn run(
    workload: ScriptedWorkload,
    executor: LaneExecutor,
) -> Result<RunSummary<RunAggregate>, RunError> {
    run_until(workload, executor, Cancellation::new()).await
}

pub async fn run_until(
    workload: ScriptedWorkload,
    executor: LaneExecutor,
    cancellation: Cancellation,
) -> Result<RunSummary<RunAggregate>, RunError> {
    Scenario::<_, _, RunAggregate>::builder()
        .name("scripted")
        .workload(workload)
        .executor(executor)
        .cancellation(cancellation)
        .build()
        .run()
        .await
}
