use serde::Serialize;
use std::{fmt::Debug, future::Future};

use crate::{Aggregate, executor::RunSummary};

/// A [`Report`] is the processed form of a finished run.
///
/// Reports turn the raw [`Aggregate`] of a [`RunSummary`] into final statistics:
/// percentiles, throughput, ratios. They are pure data, free of I/O, and can be
/// serialized or handed to a [`Reporter`].
///
/// Implementors define how to build the report from a summary via
/// `From<&RunSummary<A>>`.
pub trait Report<A>
where
    Self: Send + Sync + Debug + Serialize + for<'a> From<&'a RunSummary<A>>,
    A: Aggregate,
{
}

/// A [`Reporter`] consumes a [`Report`] and performs side effects: printing it,
/// shipping it somewhere, or storing it.
pub trait Reporter<A: Aggregate, R: Report<A>> {
    fn report(
        &self,
        report: &R,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{fmt, time::Duration};

    use serde::Deserialize;

    use super::*;
    use crate::aggregate::{FailureRecord, RunAggregate};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct LatencySummary {
        pub min: Duration,
        pub mean: Duration,
        pub p50: Duration,
        pub p90: Duration,
        pub p99: Duration,
        pub max: Duration,
    }

    impl LatencySummary {
        pub fn from_samples(samples: &[Duration]) -> Self {
            if samples.is_empty() {
                return Self::default();
            }
            let mut sorted = samples.to_vec();
            sorted.sort_unstable();
            let total: Duration = sorted.iter().sum();
            Self {
                min: sorted[0],
                mean: total.div_f64(sorted.len() as f64),
                p50: percentile(&sorted, 50.0),
                p90: percentile(&sorted, 90.0),
                p99: percentile(&sorted, 99.0),
                max: sorted[sorted.len() - 1],
            }
        }
    }

    /// Nearest-rank percentile of an already sorted, non-empty slice.
    pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    /// The built-in report for [`RunAggregate`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SummaryReport {
        pub scenario: String,
        pub lanes: usize,
        pub elapsed: Duration,
        pub success: bool,
        pub cancelled: bool,
        pub committed: u64,
        pub first_try: u64,
        pub retried_then_committed: u64,
        pub retried_attempts: u64,
        pub fatal_failures: u64,
        pub abandoned: u64,
        /// Committed iterations per second of wall time.
        pub throughput: f64,
        pub latency: LatencySummary,
        pub failures: Vec<FailureRecord>,
        /// Lane level errors, including lanes that panicked without recording.
        pub lane_errors: Vec<String>,
    }

    impl From<&RunSummary<RunAggregate>> for SummaryReport {
        fn from(value: &RunSummary<RunAggregate>) -> Self {
            let agg = &value.aggregate;
            let secs = value.elapsed.as_secs_f64();
            Self {
                scenario: value.scenario.clone(),
                lanes: value.lanes,
                elapsed: value.elapsed,
                success: value.is_success(),
                cancelled: value.cancelled,
                committed: agg.successes,
                first_try: agg.first_try_successes,
                retried_then_committed: agg.retried_successes,
                retried_attempts: agg.retried_attempts,
                fatal_failures: agg.fatal_failures,
                abandoned: agg.abandoned,
                throughput: if secs > 0.0 {
                    agg.successes as f64 / secs
                } else {
                    0.0
                },
                latency: LatencySummary::from_samples(&agg.latencies),
                failures: agg.failures.clone(),
                lane_errors: value
                    .lane_failures
                    .iter()
                    .map(|f| format!("lane {}: {}", f.lane, f.error))
                    .collect(),
            }
        }
    }

    impl Report<RunAggregate> for SummaryReport {}

    impl fmt::Display for SummaryReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let status = match (self.success, self.cancelled) {
                (false, _) => "FAILED",
                (true, true) => "CANCELLED",
                (true, false) => "OK",
            };
            writeln!(
                f,
                "{} [{status}] {} lanes in {:.2?}",
                self.scenario, self.lanes, self.elapsed
            )?;
            writeln!(
                f,
                "  committed       {} ({} first try, {} after retries)",
                self.committed, self.first_try, self.retried_then_committed
            )?;
            writeln!(f, "  retried         {} attempts", self.retried_attempts)?;
            writeln!(f, "  fatal           {}", self.fatal_failures)?;
            if self.abandoned > 0 {
                writeln!(f, "  abandoned       {}", self.abandoned)?;
            }
            writeln!(f, "  throughput      {:.2} tx/s", self.throughput)?;
            let l = &self.latency;
            writeln!(
                f,
                "  latency         min {:.2?} mean {:.2?} p50 {:.2?} p90 {:.2?} p99 {:.2?} max {:.2?}",
                l.min, l.mean, l.p50, l.p90, l.p99, l.max
            )?;
            for failure in &self.failures {
                let code = failure.code.as_deref().unwrap_or("-");
                writeln!(
                    f,
                    "  failure         lane {} after {} attempts [{code}]: {}",
                    failure.lane, failure.attempts, failure.cause
                )?;
            }
            for error in &self.lane_errors {
                writeln!(f, "  lane error      {error}")?;
            }
            Ok(())
        }
    }

    /// Prints the human readable form to stdout.
    pub struct StdoutReporter;

    impl Reporter<RunAggregate, SummaryReport> for StdoutReporter {
        async fn report(
            &self,
            report: &SummaryReport,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            print!("{report}");
            Ok(())
        }
    }

    /// Prints the report as pretty JSON to stdout.
    pub struct JsonReporter;

    impl Reporter<RunAggregate, SummaryReport> for JsonReporter {
        async fn report(
            &self,
            report: &SummaryReport,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let value = serde_json::to_string_pretty(report)?;
            println!("{value}");
            Ok(())
        }
    }

}
