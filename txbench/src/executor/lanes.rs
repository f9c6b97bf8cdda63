use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use super::{Budget, Cancellation, Executor, LaneFailure, RunSummary};
use crate::{
    aggregate::Aggregate,
    classify::{RetryClassifier, Verdict},
    error::TxError,
    metric::{AttemptOutcome, IterationMetric, IterationStatus},
    retry::RetryPolicy,
    scenario::Scenario,
    scope::{Backend, ScopeState, TransactionScope, TxOptions},
    sink::MetricsSink,
    workload::{IdGenerator, LaneContext, Workload},
};
use internals::*;

/// The semaphore implementation uses 3 bits of usize for flags.
/// Larger iteration budgets are capped to this many tokens.
const MAX_TOKENS: usize = usize::MAX >> 3;

/// Fixed pool of lanes, each running logical iterations one after another.
///
/// - Every lane loops: check shutdown, claim one budget token, run one logical
///   iteration (with in-place retries), record its metric.
/// - The iteration budget is a [`tokio::sync::Semaphore`] holding one permit per
///   allowed iteration. Lanes take permits and forget them, so exactly
///   `budget.iterations` iterations are admitted across the whole pool.
/// - A timekeeper task turns the duration budget or the scenario's
///   [`Cancellation`] into the shutdown signal observed by lanes between
///   iterations and during retry back-off.
///
/// # Tuning Knobs
///
/// - `lanes`: concurrency. Also the upper bound on simultaneously open scopes.
///   Defaults to the number of CPUs.
/// - `retry`: attempts and back-off per logical iteration.
/// - `operation_delay`: artificial pause workloads can take inside a scope via
///   [`LaneContext::pause`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct LaneExecutor {
    /// Number of concurrent lanes.
    #[builder(default = num_cpus::get())]
    pub lanes: usize,
    /// When to stop admitting new iterations.
    #[builder(default)]
    pub budget: Budget,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    pub classifier: RetryClassifier,
    /// Forwarded into every `begin`.
    #[builder(default)]
    pub tx_options: TxOptions,
    #[builder(default)]
    pub operation_delay: Duration,
}

impl<W, A> Executor<W, A> for LaneExecutor
where
    W: Workload,
    A: Aggregate,
{
    type Error = std::convert::Infallible;

    async fn exec(&self, scenario: &Scenario<W, Self, A>) -> Result<RunSummary<A>, Self::Error> {
        let lanes = self.lanes.max(1);
        let started = Instant::now();
        let (ctx, shutdown_tx) = ExecutionContext::new(self, lanes);
        if scenario.cancellation.is_cancelled() {
            tracing::info!("Scenario cancelled before start, no iteration will run.");
            shutdown_tx.send_replace(true);
        }

        tracing::info!("Spawning timekeeper task...");
        let timekeeper = tokio::spawn(timekeeper_task(
            self.budget.duration,
            scenario.cancellation.clone(),
            shutdown_tx,
        ));

        tracing::info!("Spawning {lanes} lanes for scenario: {}!", scenario.name);
        let handles = spawn_lanes(ctx.clone(), lanes, scenario.workload.clone());

        let mut lane_failures = Vec::new();
        for (lane, res) in join_all(handles).await.into_iter().enumerate() {
            match res {
                Ok(Ok(completed)) => {
                    tracing::debug!("Lane {lane} finished after {completed} iterations.");
                }
                Ok(Err(error)) => lane_failures.push(LaneFailure { lane, error }),
                Err(e) => {
                    tracing::error!("Lane {lane} panicked with error: {e}");
                    // keep the metrics the other lanes gathered, report the panic as a failure
                    lane_failures.push(LaneFailure {
                        lane,
                        error: TxError::Workload(anyhow::anyhow!("lane panicked: {e}")),
                    });
                }
            }
        }
        timekeeper.abort();

        tracing::info!("Processing results...");
        let ExecutionContext { sink, .. } = ctx;
        let aggregate = match Arc::try_unwrap(sink) {
            Ok(sink) => sink.into_snapshot(),
            Err(shared) => shared.snapshot(),
        };

        let elapsed = started.elapsed();
        tracing::info!(
            failed_lanes = lane_failures.len(),
            ?elapsed,
            "Done running scenario: {}!",
            scenario.name
        );
        Ok(RunSummary {
            scenario: scenario.name.clone(),
            lanes,
            aggregate,
            elapsed,
            cancelled: scenario.cancellation.is_cancelled(),
            lane_failures,
        })
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components for the `LaneExecutor`.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use std::{any::Any, panic::AssertUnwindSafe};

    use futures::FutureExt;
    use tokio::sync::Semaphore;

    use super::*;

    /// What every lane needs besides the workload. Identical for all lanes.
    #[derive(Debug, Clone)]
    pub struct LaneSettings {
        pub retry: RetryPolicy,
        pub classifier: RetryClassifier,
        pub tx_options: TxOptions,
        pub operation_delay: Duration,
    }

    /// Shared execution state for the timekeeper and all lanes.
    #[derive(Debug)]
    pub struct ExecutionContext<A> {
        /// Flips to `true` once no new iteration may start.
        pub shutdown: watch::Receiver<bool>,
        /// Remaining iteration budget. `None` when only time or cancellation bound the run.
        pub tokens: Option<Arc<Semaphore>>,
        pub sink: Arc<MetricsSink<A>>,
        /// The run's id generator, shared by every lane.
        pub ids: IdGenerator,
        pub settings: Arc<LaneSettings>,
    }

    impl<A> Clone for ExecutionContext<A> {
        fn clone(&self) -> Self {
            Self {
                shutdown: self.shutdown.clone(),
                tokens: self.tokens.clone(),
                sink: self.sink.clone(),
                ids: self.ids.clone(),
                settings: self.settings.clone(),
            }
        }
    }

    impl<A: Aggregate> ExecutionContext<A> {
        pub fn new(executor: &LaneExecutor, lanes: usize) -> (Self, watch::Sender<bool>) {
            let (tx, rx) = watch::channel(false);
            let tokens = executor.budget.iterations.map(|k| {
                let k = usize::try_from(k).unwrap_or(MAX_TOKENS).min(MAX_TOKENS);
                Arc::new(Semaphore::new(k))
            });
            (
                Self {
                    shutdown: rx,
                    tokens,
                    sink: Arc::new(MetricsSink::new(lanes)),
                    ids: IdGenerator::new(),
                    settings: Arc::new(LaneSettings {
                        retry: executor.retry.clone(),
                        classifier: executor.classifier.clone(),
                        tx_options: executor.tx_options,
                        operation_delay: executor.operation_delay,
                    }),
                },
                tx,
            )
        }
    }

    impl<A> ExecutionContext<A> {
        pub fn is_shutting_down(&self) -> bool {
            *self.shutdown.borrow()
        }

        /// Take one iteration from the budget. False once the budget is spent.
        pub fn claim_token(&self) -> bool {
            match &self.tokens {
                None => true,
                Some(tokens) => match tokens.try_acquire() {
                    Ok(permit) => {
                        // Permits are never handed back: one permit, one iteration.
                        permit.forget();
                        true
                    }
                    Err(_) => false,
                },
            }
        }

        /// Sleep out the retry delay. False when shutdown arrives first, meaning the
        /// iteration should not be re-attempted.
        pub async fn wait_retry_delay(&self) -> bool {
            if self.is_shutting_down() {
                return false;
            }
            let Some(delay) = self.settings.retry.delay else {
                return true;
            };
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => !self.is_shutting_down(),
                _ = shutdown.wait_for(|b| *b) => false,
            }
        }
    }

    /// Turns the duration budget or an external cancellation into the shutdown signal.
    pub async fn timekeeper_task(
        deadline: Option<Duration>,
        cancellation: Cancellation,
        shutdown: watch::Sender<bool>,
    ) {
        let mut cancelled = cancellation.subscribe();
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = expired => {
                tracing::info!("Duration budget spent, stopping lanes...");
            }
            _ = cancelled.wait_for(|b| *b) => {
                tracing::info!("Cancellation requested, draining lanes...");
            }
        };
        shutdown.send_replace(true);
    }

    /// Spawns `lanes` Tokio tasks, each running [`run_lane`].
    pub fn spawn_lanes<W, A>(
        ctx: ExecutionContext<A>,
        lanes: usize,
        workload: Arc<W>,
    ) -> Vec<JoinHandle<Result<u64, TxError>>>
    where
        W: Workload,
        A: Aggregate,
    {
        (0..lanes)
            .map(|lane| {
                let ctx = ctx.clone();
                let workload = workload.clone();
                tokio::spawn(async move { run_lane(lane, ctx, workload).await })
            })
            .collect()
    }

    /// One lane: logical iterations back to back until shutdown, budget exhaustion or
    /// a fatal failure. Returns how many iterations it completed.
    pub async fn run_lane<W, A>(
        lane: usize,
        ctx: ExecutionContext<A>,
        workload: Arc<W>,
    ) -> Result<u64, TxError>
    where
        W: Workload,
        A: Aggregate,
    {
        tracing::debug!("Lane {lane} started.");
        let mut lane_ctx = LaneContext::new(lane, ctx.ids.clone(), ctx.settings.operation_delay);
        let mut completed = 0;

        loop {
            if ctx.is_shutting_down() {
                tracing::debug!("Lane {lane} observed shutdown.");
                break;
            }
            if !ctx.claim_token() {
                tracing::debug!("Lane {lane} found the iteration budget spent.");
                break;
            }

            let (metric, error) = run_iteration(&ctx, workload.as_ref(), &mut lane_ctx).await;
            ctx.sink.record(&metric);
            completed += 1;

            if let Some(error) = error {
                tracing::error!(lane, attempts = metric.attempts, %error, "Lane stopping on fatal error.");
                return Err(error);
            }
            if metric.status == IterationStatus::Abandoned {
                tracing::debug!("Lane {lane} abandoned an iteration on shutdown.");
                break;
            }
        }

        tracing::debug!("Lane {lane} shutting down.");
        Ok(completed)
    }

    /// One logical iteration, retried in place while attempts come back retryable.
    ///
    /// Always yields exactly one metric; the error is set when the iteration failed.
    pub async fn run_iteration<W, A>(
        ctx: &ExecutionContext<A>,
        workload: &W,
        lane_ctx: &mut LaneContext,
    ) -> (IterationMetric, Option<TxError>)
    where
        W: Workload,
    {
        let lane = lane_ctx.lane();
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            lane_ctx.set_attempt(attempts);

            match attempt(&ctx.settings, workload, lane_ctx).await {
                AttemptOutcome::Success(_) => {
                    return (
                        IterationMetric::committed(lane, attempts, started.elapsed()),
                        None,
                    );
                }
                AttemptOutcome::Fatal(error) => {
                    let metric = IterationMetric::failed(lane, attempts, started.elapsed(), &error);
                    return (metric, Some(error));
                }
                AttemptOutcome::Retryable(error) => {
                    if !ctx.settings.retry.allows_another(attempts) {
                        let error = TxError::RetriesExhausted {
                            attempts,
                            last: Box::new(error),
                        };
                        let metric =
                            IterationMetric::failed(lane, attempts, started.elapsed(), &error);
                        return (metric, Some(error));
                    }
                    tracing::debug!(lane, attempts, %error, "Retrying iteration.");
                    if !ctx.wait_retry_delay().await {
                        return (
                            IterationMetric::abandoned(lane, attempts, started.elapsed()),
                            None,
                        );
                    }
                }
            }
        }
    }

    /// One attempt: begin, run the workload body, commit. Aborts on any failure,
    /// including a panicking body, which counts as a workload error.
    pub async fn attempt<W>(
        settings: &LaneSettings,
        workload: &W,
        lane_ctx: &LaneContext,
    ) -> AttemptOutcome
    where
        W: Workload,
    {
        let backend = workload.backend();
        let kind = backend.kind();
        let started = Instant::now();

        let mut scope = match backend.begin(&settings.tx_options).await {
            Ok(scope) => scope,
            Err(error @ TxError::Acquisition(_)) => {
                return if settings.retry.retry_acquisition {
                    AttemptOutcome::Retryable(error)
                } else {
                    AttemptOutcome::Fatal(error)
                };
            }
            Err(error) => return verdict(&settings.classifier, error, kind),
        };

        let body = AssertUnwindSafe(workload.iteration(&mut scope, lane_ctx))
            .catch_unwind()
            .await;
        let result = match body {
            Ok(Ok(())) => scope.commit().await,
            Ok(Err(error)) => Err(error),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(lane = lane_ctx.lane(), "Workload panicked: {message}");
                Err(TxError::Workload(anyhow::anyhow!(
                    "workload panicked: {message}"
                )))
            }
        };

        match result {
            Ok(()) => AttemptOutcome::Success(started.elapsed()),
            Err(error) => {
                if scope.state() == ScopeState::Open {
                    if let Err(abort_error) = scope.abort().await {
                        tracing::warn!(
                            lane = lane_ctx.lane(),
                            %abort_error,
                            "Abort failed, keeping the original outcome."
                        );
                    }
                }
                verdict(&settings.classifier, error, kind)
            }
        }
    }

    fn panic_message(payload: &(dyn Any + Send)) -> &str {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            *message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "unknown panic"
        }
    }

    fn verdict(
        classifier: &RetryClassifier,
        error: TxError,
        kind: crate::scope::BackendKind,
    ) -> AttemptOutcome {
        match classifier.classify(&error, kind) {
            Verdict::Retryable => AttemptOutcome::Retryable(error),
            Verdict::Fatal => AttemptOutcome::Fatal(error),
        }
    }
}
