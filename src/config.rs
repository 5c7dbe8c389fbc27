//! Loop configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Commits slower than this are logged at WARN
pub const DEFAULT_LONG_RUNNING_COMMIT: Duration = Duration::from_secs(6);

/// Construction-time settings of a [`TransactionLoop`](crate::TransactionLoop).
///
/// Durations are (de)serialized as fractional seconds; missing fields take
/// their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Base of the exponential backoff; `None` disables sleeping
    #[serde(with = "opt_secs")]
    pub backoff_base: Option<Duration>,
    /// Commits slower than this are logged at WARN
    #[serde(with = "secs")]
    pub long_commit_threshold: Duration,
    /// Probability that an individual stat is reported
    pub sample_rate: f64,
    /// Abort instead of commit when the handler succeeds
    pub side_effect_free: bool,
    /// Above this many joined resources only a count is logged
    pub side_effect_free_resource_limit: usize,
    /// Fail the run when a side-effect-free transaction joined resources
    pub side_effect_free_strict: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: None,
            long_commit_threshold: DEFAULT_LONG_RUNNING_COMMIT,
            sample_rate: 0.2,
            side_effect_free: false,
            side_effect_free_resource_limit: 5,
            side_effect_free_strict: false,
        }
    }
}

impl LoopConfig {
    /// Config allowing `retries` retries after the first attempt
    pub fn from_retries(retries: u32) -> Self {
        Self {
            attempts: retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Check the settings before a loop is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }
        Ok(())
    }
}

/// Invalid [`LoopConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `attempts` was zero
    #[error("attempts must be at least 1")]
    ZeroAttempts,
    /// `sample_rate` outside `[0, 1]`
    #[error("sample rate must be within [0, 1], got {0}")]
    SampleRate(f64),
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
