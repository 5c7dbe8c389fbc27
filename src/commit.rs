//! Timed commit of a single attempt

use crate::runtime::Clock;
use crate::{CommitError, Transaction, TransactionError};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful commit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitReport {
    /// Wall time spent inside `commit`
    pub duration: Duration,
    /// `duration` exceeded the long-commit threshold
    pub long: bool,
}

/// Commits a transaction, timing it and translating low-level failures
#[derive(Clone)]
pub struct CommitExecutor {
    clock: Arc<dyn Clock>,
}

impl CommitExecutor {
    /// Executor timing commits with `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Commit `transaction`.
    ///
    /// `attempt_index` and `prior_sleep` are only used for log correlation.
    pub fn commit<T: Transaction>(
        &self,
        transaction: &T,
        long_threshold: Duration,
        attempt_index: u32,
        prior_sleep: Duration,
        description: Option<&str>,
    ) -> Result<CommitReport, CommitError> {
        let started = self.clock.now();
        match transaction.commit() {
            Ok(()) => {}
            Err(TransactionError::InvalidArgument(message)) => {
                return Err(CommitError::Failed { message });
            }
            Err(error @ TransactionError::InvalidState(_)) => {
                // Already toast (e.g. mid-abort elsewhere); the caller's error wins.
                tracing::error!(
                    transaction = %transaction.id(),
                    error = %error,
                    "Failing to commit; should already be an error in progress"
                );
                return Err(error.into());
            }
            Err(error) => return Err(error.into()),
        }

        let duration = self.clock.now().saturating_duration_since(started);
        let long = duration > long_threshold;
        let description = description.unwrap_or("");
        if long {
            tracing::warn!(
                transaction = %transaction.id(),
                description,
                duration_ms = duration.as_millis() as u64,
                retries = attempt_index,
                sleep_ms = prior_sleep.as_millis() as u64,
                "Committed transaction"
            );
        } else {
            tracing::debug!(
                transaction = %transaction.id(),
                description,
                duration_ms = duration.as_millis() as u64,
                retries = attempt_index,
                sleep_ms = prior_sleep.as_millis() as u64,
                "Committed transaction"
            );
        }

        Ok(CommitReport { duration, long })
    }
}
