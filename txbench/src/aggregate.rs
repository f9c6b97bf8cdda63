use std::fmt::Debug;

use crate::metric::IterationMetric;

/// The `Aggregate` trait defines how [`IterationMetric`]s recorded by the lanes are
/// folded into a compact, mergeable representation.
///
/// Aggregates keep raw material only (counters, latency samples, failure records).
/// Derived statistics such as percentiles or throughput belong in a
/// [`Report`](crate::report::Report), built once the run is over.
///
/// # Role
///
/// - Collect one metric per logical iteration from a lane.
/// - Be cheap to update: lanes call [`consume`](Aggregate::consume) on their hot path.
/// - Be mergeable so per-lane aggregates combine into the run snapshot.
///
/// # Implementor notes
/// - `merge` must be associative. The sink merges lanes in lane order, so an
///   aggregate that appends samples keeps the arrival order of each lane intact.
/// - Document how much memory your representation keeps per sample.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use txbench::{Aggregate, metric::IterationMetric};
///
/// #[derive(Debug, Clone, Default)]
/// struct Slowest(Duration);
///
/// impl Aggregate for Slowest {
///     fn new() -> Self {
///         Self::default()
///     }
///
///     fn consume(&mut self, metric: &IterationMetric) {
///         self.0 = self.0.max(metric.latency);
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.0 = self.0.max(other.0);
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone + 'static,
{
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Fold multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[IterationMetric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Fold a single metric.
    fn consume(&mut self, metric: &IterationMetric);

    /// Combine another aggregate into this one.
    fn merge(&mut self, other: Self);
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::metric::IterationStatus;

    /// A fatal failure as it appears in the final report.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FailureRecord {
        pub lane: usize,
        pub attempts: u32,
        pub cause: String,
        pub code: Option<String>,
    }

    /// The built-in run snapshot.
    ///
    /// - **Counters:** committed iterations, split into first-try and
    ///   retried-then-committed, every retried attempt, fatal failures and
    ///   iterations abandoned on cancellation.
    /// - **Latencies:** one sample per logical iteration, whatever its status, kept
    ///   unbounded and in arrival order per lane.
    /// - **Failures:** one record per fatal iteration. A lane stops on its first
    ///   fatal failure, so there are at most as many records as lanes.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct RunAggregate {
        pub successes: u64,
        pub first_try_successes: u64,
        pub retried_successes: u64,
        pub retried_attempts: u64,
        pub fatal_failures: u64,
        pub abandoned: u64,
        pub latencies: Vec<Duration>,
        pub failures: Vec<FailureRecord>,
    }

    impl RunAggregate {
        /// Logical iterations recorded, whatever their outcome.
        pub fn iterations(&self) -> u64 {
            self.successes + self.fatal_failures + self.abandoned
        }
    }

    impl Aggregate for RunAggregate {
        fn new() -> Self {
            RunAggregate::default()
        }

        fn consume(&mut self, metric: &IterationMetric) {
            self.retried_attempts += u64::from(metric.retries());
            self.latencies.push(metric.latency);
            match &metric.status {
                IterationStatus::Committed => {
                    self.successes += 1;
                    if metric.attempts > 1 {
                        self.retried_successes += 1;
                    } else {
                        self.first_try_successes += 1;
                    }
                }
                IterationStatus::Failed { cause, code } => {
                    self.fatal_failures += 1;
                    self.failures.push(FailureRecord {
                        lane: metric.lane,
                        attempts: metric.attempts,
                        cause: cause.clone(),
                        code: code.clone(),
                    });
                }
                IterationStatus::Abandoned => self.abandoned += 1,
            }
        }

        fn merge(&mut self, other: Self) {
            self.successes += other.successes;
            self.first_try_successes += other.first_try_successes;
            self.retried_successes += other.retried_successes;
            self.retried_attempts += other.retried_attempts;
            self.fatal_failures += other.fatal_failures;
            self.abandoned += other.abandoned;
            self.latencies.extend(other.latencies);
            self.failures.extend(other.failures);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::error::{DbError, SqlState, TxError};

        #[test]
        fn splits_first_try_from_retried_commits() {
            let mut agg = RunAggregate::new();
            agg.aggregate(&[
                IterationMetric::committed(0, 1, Duration::from_millis(2)),
                IterationMetric::committed(0, 4, Duration::from_millis(9)),
            ]);

            assert_eq!(agg.successes, 2);
            assert_eq!(agg.first_try_successes, 1);
            assert_eq!(agg.retried_successes, 1);
            assert_eq!(agg.retried_attempts, 3);
            assert_eq!(agg.latencies.len(), 2);
        }

        #[test]
        fn failures_keep_cause_and_code() {
            let err: TxError = DbError::new(SqlState::UNIQUE_VIOLATION, "duplicate key").into();
            let mut agg = RunAggregate::new();
            agg.consume(&IterationMetric::failed(3, 1, Duration::ZERO, &err));

            assert_eq!(agg.fatal_failures, 1);
            assert_eq!(agg.failures[0].lane, 3);
            assert_eq!(agg.failures[0].code.as_deref(), Some("23505"));
            assert!(agg.failures[0].cause.contains("duplicate key"));
        }

        #[test]
        fn merge_appends_in_order() {
            let mut a = RunAggregate::new();
            a.consume(&IterationMetric::committed(0, 1, Duration::from_millis(1)));
            a.consume(&IterationMetric::committed(0, 1, Duration::from_millis(2)));
            let mut b = RunAggregate::new();
            b.consume(&IterationMetric::abandoned(1, 2, Duration::from_millis(3)));

            a.merge(b);
            assert_eq!(a.iterations(), 3);
            assert_eq!(a.abandoned, 1);
            assert_eq!(
                a.latencies,
                vec![
                    Duration::from_millis(1),
                    Duration::from_millis(2),
                    Duration::from_millis(3)
                ]
            );
        }
    }
}
