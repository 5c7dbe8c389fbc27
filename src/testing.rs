//! Test helpers: deterministic clock and sleeper, tracing setup

use crate::runtime::{Clock, SleepFuture, Sleeper};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Install a `fmt` subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sleeper that records requested delays and returns immediately
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Sleeper with nothing recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        Box::pin(std::future::ready(()))
    }
}

/// Clock that advances by a fixed step on every reading
pub struct StepClock {
    base: Instant,
    step: Duration,
    readings: Mutex<u32>,
}

impl StepClock {
    /// Clock whose readings are `step` apart
    pub fn new(step: Duration) -> Self {
        Self {
            base: Instant::now(),
            step,
            readings: Mutex::new(0),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> Instant {
        let mut readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.base + self.step * *readings;
        *readings += 1;
        now
    }
}
