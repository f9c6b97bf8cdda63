//! txbench: a backend-agnostic benchmark engine for transactional workloads.
//!
//! txbench drives a fixed population of concurrent simulated users (lanes). Each
//! lane repeatedly runs a caller supplied transactional operation against a
//! storage backend while the engine measures throughput and latency, and
//! transparently re-attempts operations the backend reported as transient
//! (write conflicts, serialization failures).
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: glue that ties a [`Workload`] to an [`Executor`] and runs
//!   `setup → lanes → close`.
//! - [`Workload`]: the operation being benchmarked, split in `setup`, `iteration`
//!   and `close` hooks.
//! - [`scope`]: transaction scopes. A [`Backend`](scope::Backend) opens one
//!   [`TransactionScope`](scope::TransactionScope) per attempt, either session scoped
//!   (labeled command errors) or connection scoped (SQLSTATE errors).
//! - [`RetryClassifier`]: decides whether a failed attempt may run again.
//! - [`Executor`]: runs the lanes. [`LaneExecutor`] is the built-in pool with
//!   iteration and time budgets, retries and cancellation.
//! - [`Aggregate`]: folds one [`IterationMetric`](metric::IterationMetric) per
//!   logical iteration into mergeable counters and samples.
//! - [`Report`]: turns a finished [`RunSummary`](executor::RunSummary) into final
//!   statistics; a [`Reporter`] sends it somewhere.
//!
//! # Example
//!
//! Booking flights on the in-memory document store:
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use txbench::{
//!     LaneExecutor, Reporter, Scenario,
//!     aggregate::RunAggregate,
//!     executor::Budget,
//!     memory::{MemoryDocClient, MemoryEngine},
//!     report::{StdoutReporter, SummaryReport},
//!     retry::RetryPolicy,
//!     scope::SessionBackend,
//!     workloads::FlightBooking,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = MemoryDocClient::new(Arc::new(MemoryEngine::new()), 8);
//!     let workload = FlightBooking::builder()
//!         .backend(SessionBackend::new(client, Duration::from_secs(5)))
//!         .seed_schedules(10)
//!         .build();
//!
//!     let summary = Scenario::<_, _, RunAggregate>::builder()
//!         .name("flight bookings")
//!         .workload(workload)
//!         .executor(
//!             LaneExecutor::builder()
//!                 .lanes(8)
//!                 .budget(Budget::count(500))
//!                 .retry(RetryPolicy::builder().max_attempts(50).build())
//!                 .build(),
//!         )
//!         .build()
//!         .run()
//!         .await
//!         .unwrap();
//!
//!     let report = SummaryReport::from(&summary);
//!     StdoutReporter.report(&report).await.unwrap();
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: [`RunAggregate`](aggregate::RunAggregate), the built-in reports and
//!   reporters, the in-memory backends and the flight booking workload. (Enabled by
//!   default)
//! - `internals`: exposes the lane machinery of [`LaneExecutor`] for custom executors.

/// Metric aggregators
pub mod aggregate;
/// Which failures may be retried
pub mod classify;
/// Run configuration
pub mod config;
pub mod error;
/// Orchestrators that run the lanes
pub mod executor;
/// Per iteration metrics
pub mod metric;
/// Reports and Reporters
pub mod report;
pub mod retry;
/// Main module of the crate that glues everything together
pub mod scenario;
pub mod scope;
pub mod sink;
pub mod workload;

/// In-memory reference backends
#[cfg(feature = "builtins")]
pub mod memory;
/// Sample workloads
#[cfg(feature = "builtins")]
pub mod workloads;

pub use aggregate::Aggregate;
pub use classify::{RetryClassifier, Verdict};
pub use config::RunConfig;
pub use executor::{Executor, LaneExecutor};
pub use report::{Report, Reporter};
pub use retry::RetryPolicy;
pub use scenario::Scenario;
pub use workload::{IdGenerator, LaneContext, Workload};
