//! Attempt bookkeeping and the per-attempt abort guard

use crate::Transaction;
use std::time::Duration;

/// Where an attempt sits in the run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptPosition {
    /// The first attempt of a run
    First,
    /// An attempt with more to follow
    Retry,
    /// The final attempt
    Last,
}

/// Counters for one attempt of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt {
    /// 0-based, increases by one per attempt
    pub index: u32,
    /// Attempts left after this one
    pub attempts_remaining: u32,
    /// Total time slept before this attempt
    pub accumulated_sleep: Duration,
}

impl Attempt {
    /// The first of `attempts` attempts
    pub fn first(attempts: u32) -> Self {
        Self {
            index: 0,
            attempts_remaining: attempts.saturating_sub(1),
            accumulated_sleep: Duration::ZERO,
        }
    }

    /// The attempt following this one, after sleeping `slept`.
    /// Callers check [`is_last`](Self::is_last) first.
    pub fn next(&self, slept: Duration) -> Self {
        Self {
            index: self.index + 1,
            attempts_remaining: self.attempts_remaining.saturating_sub(1),
            accumulated_sleep: self.accumulated_sleep.saturating_add(slept),
        }
    }

    /// No attempts remain after this one
    pub fn is_last(&self) -> bool {
        self.attempts_remaining == 0
    }

    /// Which position event this attempt announces
    pub fn position(&self) -> AttemptPosition {
        if self.index == 0 {
            AttemptPosition::First
        } else if self.is_last() {
            AttemptPosition::Last
        } else {
            AttemptPosition::Retry
        }
    }
}

/// Aborts the attempt's transaction if dropped while still armed.
///
/// This covers a run being cancelled, or a panic unwinding out of the
/// handler; the loop disarms the guard once it owns the outcome.
pub(crate) struct AttemptGuard<'a, T: Transaction> {
    transaction: &'a T,
    armed: bool,
}

impl<'a, T: Transaction> AttemptGuard<'a, T> {
    pub(crate) fn new(transaction: &'a T) -> Self {
        Self {
            transaction,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Transaction> Drop for AttemptGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(error) = self.transaction.abort() {
            tracing::error!(
                transaction = %self.transaction.id(),
                error = %error,
                "Failed to abort interrupted transaction"
            );
        }
    }
}
