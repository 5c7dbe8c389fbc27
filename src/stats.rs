//! Loop statistics

use crate::backoff::RandomSource;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter names emitted by the loop
pub mod names {
    /// Retries made, counted when the run finishes
    pub const RETRY: &str = "transaction.retry";
    /// Runs that committed
    pub const SUCCESSFUL: &str = "transaction.successful";
    /// Runs that returned an error
    pub const FAILED: &str = "transaction.failed";
    /// Attempts aborted because the transaction was doomed
    pub const DOOMED: &str = "transaction.doomed";
    /// Attempts aborted because the handler vetoed the commit
    pub const VETOED: &str = "transaction.vetoed";
    /// Attempts aborted because they were side-effect free
    pub const SIDE_EFFECT_FREE: &str = "transaction.side_effect_free";
    /// Side-effect-free attempts that joined resources anyway
    pub const SIDE_EFFECT_FREE_VIOLATION: &str = "transaction.side_effect_free_violation";
}

/// Fire-and-forget counter sink
pub trait StatsEmitter: Send + Sync + 'static {
    /// Add `count` to the counter `name`
    fn incr(&self, name: &str, count: u64);

    /// Push anything buffered downstream
    fn flush(&self) {}
}

/// Discards every stat
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStats;

impl StatsEmitter for NullStats {
    fn incr(&self, _name: &str, _count: u64) {}
}

/// In-process counters
pub struct LoopStats {
    /// Retries made
    pub retry: AtomicU64,
    /// Runs that committed
    pub successful: AtomicU64,
    /// Runs that failed
    pub failed: AtomicU64,
    /// Doomed aborts
    pub doomed: AtomicU64,
    /// Vetoed aborts
    pub vetoed: AtomicU64,
    /// Side-effect-free aborts
    pub side_effect_free: AtomicU64,
    /// Side-effect-free attempts that joined resources
    pub side_effect_free_violation: AtomicU64,
    /// Calls to `flush`, one per run
    pub flushes: AtomicU64,
}

impl LoopStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            retry: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            doomed: AtomicU64::new(0),
            vetoed: AtomicU64::new(0),
            side_effect_free: AtomicU64::new(0),
            side_effect_free_violation: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    fn counter(&self, name: &str) -> Option<&AtomicU64> {
        match name {
            names::RETRY => Some(&self.retry),
            names::SUCCESSFUL => Some(&self.successful),
            names::FAILED => Some(&self.failed),
            names::DOOMED => Some(&self.doomed),
            names::VETOED => Some(&self.vetoed),
            names::SIDE_EFFECT_FREE => Some(&self.side_effect_free),
            names::SIDE_EFFECT_FREE_VIOLATION => Some(&self.side_effect_free_violation),
            _ => None,
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            retry: self.retry.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            doomed: self.doomed.load(Ordering::Relaxed),
            vetoed: self.vetoed.load(Ordering::Relaxed),
            side_effect_free: self.side_effect_free.load(Ordering::Relaxed),
            side_effect_free_violation: self.side_effect_free_violation.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Default for LoopStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsEmitter for LoopStats {
    fn incr(&self, name: &str, count: u64) {
        match self.counter(name) {
            Some(counter) => {
                counter.fetch_add(count, Ordering::Relaxed);
            }
            None => tracing::trace!(name, "Ignoring unknown stat"),
        }
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Copy of [`LoopStats`] taken by [`LoopStats::snapshot`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoopStatsSnapshot {
    /// See [`LoopStats::retry`]
    pub retry: u64,
    /// See [`LoopStats::successful`]
    pub successful: u64,
    /// See [`LoopStats::failed`]
    pub failed: u64,
    /// See [`LoopStats::doomed`]
    pub doomed: u64,
    /// See [`LoopStats::vetoed`]
    pub vetoed: u64,
    /// See [`LoopStats::side_effect_free`]
    pub side_effect_free: u64,
    /// See [`LoopStats::side_effect_free_violation`]
    pub side_effect_free_violation: u64,
    /// See [`LoopStats::flushes`]
    pub flushes: u64,
}

/// Per-run buffer of sampled increments.
///
/// Flushed to the emitter exactly once, when dropped, so every exit path of
/// a run (including cancellation) delivers its stats.
pub(crate) struct StatsBuffer<'a> {
    emitter: &'a dyn StatsEmitter,
    random: &'a dyn RandomSource,
    sample_rate: f64,
    buf: Vec<(&'static str, u64)>,
}

impl<'a> StatsBuffer<'a> {
    pub(crate) fn new(
        emitter: &'a dyn StatsEmitter,
        random: &'a dyn RandomSource,
        sample_rate: f64,
    ) -> Self {
        Self {
            emitter,
            random,
            sample_rate,
            buf: Vec::new(),
        }
    }

    pub(crate) fn incr(&mut self, name: &'static str, count: u64) {
        if count == 0 || self.sample_rate <= 0.0 {
            return;
        }
        if self.sample_rate >= 1.0 || self.random.unit() < self.sample_rate {
            self.buf.push((name, count));
        }
    }
}

impl Drop for StatsBuffer<'_> {
    fn drop(&mut self) {
        for (name, count) in self.buf.drain(..) {
            self.emitter.incr(name, count);
        }
        self.emitter.flush();
    }
}
