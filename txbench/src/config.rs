//! Run configuration.
//!
//! Every field has a default so a config file only needs to name what it changes:
//!
//! ```toml
//! concurrency = 16
//! iterations = 10000
//!
//! [retry]
//! max_attempts = 5
//! delay_ms = 10
//! extra_sqlstates = ["40P01"]
//!
//! [backend]
//! kind = "connection"
//! acquire_timeout_ms = 2000
//! ```
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    classify::RetryClassifier,
    error::ConfigError,
    executor::{Budget, LaneExecutor},
    retry::RetryPolicy,
    scope::{BackendKind, TxOptions},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Number of lanes.
    pub concurrency: usize,
    /// Total logical iterations across all lanes.
    pub iterations: Option<u64>,
    /// Wall-clock budget in seconds.
    pub duration_secs: Option<u64>,
    /// Pause workloads take inside a scope, in milliseconds.
    pub operation_delay_ms: u64,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
    pub tx: TxOptions,
    pub workload: WorkloadConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            iterations: None,
            duration_secs: None,
            operation_delay_ms: 0,
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
            tx: TxOptions::default(),
            workload: WorkloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub delay_ms: Option<u64>,
    pub retry_acquisition: bool,
    /// SQLSTATEs retried on top of `40001`.
    pub extra_sqlstates: Vec<String>,
    /// Error labels retried on top of the transient transaction labels.
    pub extra_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Size of the session or connection pool. Defaults to `concurrency`.
    pub max_handles: Option<usize>,
    pub acquire_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Session,
            max_handles: None,
            acquire_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    pub day_range: u64,
    pub seed_schedules: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            day_range: 1,
            seed_schedules: 100,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "at least one lane is required"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(invalid("retry.max_attempts", "must allow at least one attempt"));
        }
        if self.backend.max_handles == Some(0) {
            return Err(invalid("backend.max_handles", "must be at least 1"));
        }
        // The memory pools hold one semaphore permit per handle.
        if self.max_handles() > Semaphore::MAX_PERMITS {
            let field = match self.backend.max_handles {
                Some(_) => "backend.max_handles",
                None => "concurrency",
            };
            return Err(invalid(
                field,
                format!("must not exceed {} handles", Semaphore::MAX_PERMITS),
            ));
        }
        if self.workload.day_range == 0 {
            return Err(invalid("workload.day_range", "must be at least 1"));
        }
        if let Some(code) = self
            .retry
            .extra_sqlstates
            .iter()
            .find(|code| code.len() != 5 || !code.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(invalid(
                "retry.extra_sqlstates",
                format!("'{code}' is not a five character SQLSTATE"),
            ));
        }
        Ok(())
    }

    pub fn budget(&self) -> Budget {
        Budget {
            iterations: self.iterations,
            duration: self.duration_secs.map(Duration::from_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            delay: self.retry.delay_ms.map(Duration::from_millis),
            retry_acquisition: self.retry.retry_acquisition,
        }
    }

    /// Default tables plus the configured extras.
    pub fn classifier(&self) -> RetryClassifier {
        let classifier = self
            .retry
            .extra_sqlstates
            .iter()
            .fold(RetryClassifier::default(), |c, code| c.with_sqlstate(code.as_str()));
        self.retry
            .extra_labels
            .iter()
            .fold(classifier, |c, label| c.with_label(label.as_str()))
    }

    pub fn max_handles(&self) -> usize {
        self.backend.max_handles.unwrap_or(self.concurrency).max(1)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.acquire_timeout_ms)
    }

    pub fn operation_delay(&self) -> Duration {
        Duration::from_millis(self.operation_delay_ms)
    }

    pub fn executor(&self) -> LaneExecutor {
        LaneExecutor::builder()
            .lanes(self.concurrency)
            .budget(self.budget())
            .retry(self.retry_policy())
            .classifier(self.classifier())
            .tx_options(self.tx)
            .operation_delay(self.operation_delay())
            .build()
    }
}
