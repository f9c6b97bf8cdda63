use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// How often and how patiently one logical iteration is re-attempted after a
/// retryable failure.
///
/// The policy applies per logical iteration, never per run: every new iteration
/// starts again with a fresh attempt count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct RetryPolicy {
    /// Maximum attempts per logical iteration, the first one included.
    /// `None` retries for as long as the error stays retryable.
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<u32>,
    /// Pause between two attempts of the same iteration.
    #[builder(default, setter(strip_option))]
    pub delay: Option<Duration>,
    /// Treat [`TxError::Acquisition`](crate::error::TxError::Acquisition) as retryable.
    #[builder(default = false)]
    pub retry_acquisition: bool,
}

impl RetryPolicy {
    /// Never re-attempt anything.
    pub fn no_retry() -> Self {
        Self::builder().max_attempts(1).build()
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn allows_another(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}
