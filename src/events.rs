//! Loop lifecycle events

use super::{Invocation, TransactionId};
use std::time::Duration;

/// Events published synchronously while a loop runs
#[derive(Clone, Debug)]
pub enum LoopEvent {
    /// A transaction was begun for an attempt
    AfterTransactionBegan {
        /// Snapshot of the run
        invocation: Invocation,
        /// The new transaction
        transaction: TransactionId,
    },
    /// About to run the handler for the first time
    WillFirstAttempt {
        /// Snapshot of the run
        invocation: Invocation,
        /// Current transaction
        transaction: TransactionId,
        /// 0-based attempt index
        attempt: u32,
    },
    /// About to run the handler again, with more attempts left after this one
    WillRetryAttempt {
        /// Snapshot of the run
        invocation: Invocation,
        /// Current transaction
        transaction: TransactionId,
        /// 0-based attempt index
        attempt: u32,
    },
    /// About to run the handler for the last time
    WillLastAttempt {
        /// Snapshot of the run
        invocation: Invocation,
        /// Current transaction
        transaction: TransactionId,
        /// 0-based attempt index
        attempt: u32,
    },
    /// About to sleep before the next attempt. Subscribers may change `sleep`.
    WillSleepBetweenAttempts {
        /// Snapshot of the run, at the attempt that just failed
        invocation: Invocation,
        /// Delay the loop will sleep for
        sleep: Duration,
    },
}

impl LoopEvent {
    /// Snapshot of the run the event belongs to
    pub fn invocation(&self) -> &Invocation {
        match self {
            Self::AfterTransactionBegan { invocation, .. } => invocation,
            Self::WillFirstAttempt { invocation, .. } => invocation,
            Self::WillRetryAttempt { invocation, .. } => invocation,
            Self::WillLastAttempt { invocation, .. } => invocation,
            Self::WillSleepBetweenAttempts { invocation, .. } => invocation,
        }
    }

    /// Stable snake_case name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AfterTransactionBegan { .. } => "after_transaction_began",
            Self::WillFirstAttempt { .. } => "will_first_attempt",
            Self::WillRetryAttempt { .. } => "will_retry_attempt",
            Self::WillLastAttempt { .. } => "will_last_attempt",
            Self::WillSleepBetweenAttempts { .. } => "will_sleep_between_attempts",
        }
    }

    /// Transaction the event concerns, if any
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::AfterTransactionBegan { transaction, .. }
            | Self::WillFirstAttempt { transaction, .. }
            | Self::WillRetryAttempt { transaction, .. }
            | Self::WillLastAttempt { transaction, .. } => Some(*transaction),
            Self::WillSleepBetweenAttempts { .. } => None,
        }
    }

    /// Attempt index, for the `Will*Attempt` events
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::WillFirstAttempt { attempt, .. }
            | Self::WillRetryAttempt { attempt, .. }
            | Self::WillLastAttempt { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// The requested sleep, for `WillSleepBetweenAttempts`
    pub fn sleep(&self) -> Option<Duration> {
        match self {
            Self::WillSleepBetweenAttempts { sleep, .. } => Some(*sleep),
            _ => None,
        }
    }
}
