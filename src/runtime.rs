//! Injectable clock and sleeper

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Future returned by [`Sleeper::sleep`]
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Waits between attempts.
///
/// The wait must only suspend the calling task, never block the executor.
pub trait Sleeper: Send + Sync + 'static {
    /// Resolve after `duration`
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Sleeps on the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Monotonic time source used to time commits
pub trait Clock: Send + Sync + 'static {
    /// The current instant
    fn now(&self) -> Instant;
}

/// Reads [`Instant::now`]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
