//! Binary exponential backoff between attempts

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of randomness for backoff jitter and stats sampling
pub trait RandomSource: Send + Sync + 'static {
    /// Uniform integer in `0..=upper`
    fn uniform_inclusive(&self, upper: u64) -> u64;

    /// Uniform float in `0.0..1.0`
    fn unit(&self) -> f64;
}

/// Thread-local OS-seeded generator
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn uniform_inclusive(&self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..=upper)
    }

    fn unit(&self) -> f64 {
        rand::thread_rng().gen()
    }
}

/// Deterministic generator for reproducible runs
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Generator seeded with `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn uniform_inclusive(&self, upper: u64) -> u64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..=upper)
    }

    fn unit(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen()
    }
}

/// Always draws the largest value: worst-case delays, every stat sampled
#[derive(Clone, Copy, Debug, Default)]
pub struct CeilingRandom;

impl RandomSource for CeilingRandom {
    fn uniform_inclusive(&self, upper: u64) -> u64 {
        upper
    }

    fn unit(&self) -> f64 {
        0.0
    }
}

/// Delay policy: `base * uniform(0, 2^(attempt_index + 1) - 1)`.
///
/// `attempt_index` is the 0-based index of the attempt that just failed, so
/// the first retry waits at most `base`. Without a base there is no delay.
#[derive(Clone)]
pub struct BackoffPolicy {
    base: Option<Duration>,
    random: Arc<dyn RandomSource>,
}

impl BackoffPolicy {
    /// Policy sleeping in multiples of `base`; a zero base disables it
    pub fn new(base: Option<Duration>, random: Arc<dyn RandomSource>) -> Self {
        Self {
            base: base.filter(|b| !b.is_zero()),
            random,
        }
    }

    /// Will the loop sleep between attempts at all?
    pub fn is_enabled(&self) -> bool {
        self.base.is_some()
    }

    /// Base delay, if backoff is enabled
    pub fn base(&self) -> Option<Duration> {
        self.base
    }

    /// Delay before the attempt following `attempt_index`
    pub fn next_delay(&self, attempt_index: u32) -> Duration {
        let Some(base) = self.base else {
            return Duration::ZERO;
        };
        let exponent = attempt_index.saturating_add(1).min(63);
        let ceiling = (1u64 << exponent) - 1;
        let factor = self.random.uniform_inclusive(ceiling);
        base.saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
    }
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy").field("base", &self.base).finish()
    }
}
