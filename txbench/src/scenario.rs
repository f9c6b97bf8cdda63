use std::{marker::PhantomData, sync::Arc};

use typed_builder::TypedBuilder;

use crate::{
    aggregate::Aggregate,
    error::RunError,
    executor::{Cancellation, Executor, RunSummary},
    workload::Workload,
};

/// A `Scenario` ties a [`Workload`] to the [`Executor`] that drives it.
///
/// Running a scenario is one Run: `setup` once, the executor's lanes, then `close`
/// once. The aggregate type `A` picks how metrics are summarised.
///
/// # Example
/// ```rust,no_run
/// # use txbench::{Scenario, LaneExecutor, Workload, executor::Budget, aggregate::RunAggregate};
/// # async fn go<W: Workload>(workload: W) -> Result<(), txbench::error::RunError> {
/// let summary = Scenario::<_, _, RunAggregate>::builder()
///     .name("bookings")
///     .workload(workload)
///     .executor(LaneExecutor::builder().lanes(8).budget(Budget::count(1_000)).build())
///     .build()
///     .run()
///     .await?;
/// assert!(summary.is_success());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario<W, E, A>
where
    W: Workload,
    E: Executor<W, A>,
    A: Aggregate,
{
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(transform = |workload: W| Arc::new(workload)))]
    pub workload: Arc<W>,
    pub executor: E,
    /// Stops lanes from admitting new iterations once triggered.
    #[builder(default)]
    pub cancellation: Cancellation,
    #[builder(default, setter(skip))]
    aggregate: PhantomData<A>,
}

impl<W, E, A> Scenario<W, E, A>
where
    W: Workload,
    E: Executor<W, A>,
    A: Aggregate,
{
    /// Run the scenario to completion.
    ///
    /// A failing `setup` ends the run before any iteration; `close` is still called
    /// to release backend handles. A failing `close` is only logged.
    pub async fn run(&self) -> Result<RunSummary<A>, RunError> {
        tracing::info!("Setting up workload: {}", self.workload.name());
        if let Err(source) = self.workload.setup().await {
            tracing::error!(%source, "Setup failed, no iteration will run.");
            self.close().await;
            return Err(RunError::Setup {
                workload: self.workload.name().to_string(),
                source,
            });
        }

        let summary = self
            .executor
            .exec(self)
            .await
            .map_err(|e| RunError::Executor(Box::new(e)));
        self.close().await;
        summary
    }

    async fn close(&self) {
        if let Err(e) = self.workload.close().await {
            tracing::warn!(error = %e, "Closing workload failed, ignoring.");
        }
    }
}
