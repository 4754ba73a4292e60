use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{StreamError, StreamResult};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_FULL_REFRESH_THRESHOLD: Duration = Duration::from_millis(60_000);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Static tuning for one stream subscription. Supplied once, never mutated.
///
/// Durations are (de)serialized as integer milliseconds so the same shape can
/// live in a settings file or be built from command-line flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    #[serde(rename = "full_refresh_threshold_ms", with = "duration_ms")]
    pub full_refresh_threshold: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            full_refresh_threshold: DEFAULT_FULL_REFRESH_THRESHOLD,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl ReconnectionConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration, full_refresh_threshold: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            full_refresh_threshold,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Check every field. Nothing is clamped: a bad value is an error.
    pub fn validate(&self) -> StreamResult<()> {
        self.validate_backoff()?;
        self.validate_refresh_threshold()
    }

    pub(crate) fn validate_backoff(&self) -> StreamResult<()> {
        if self.initial_delay.is_zero() {
            return Err(StreamError::invalid_parameter(
                "initial_delay",
                "must be greater than zero",
            ));
        }
        if self.max_delay.is_zero() {
            return Err(StreamError::invalid_parameter(
                "max_delay",
                "must be greater than zero",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(StreamError::invalid_parameter(
                "max_delay",
                format!(
                    "{}ms is below initial_delay {}ms",
                    self.max_delay.as_millis(),
                    self.initial_delay.as_millis()
                ),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(StreamError::invalid_parameter(
                "backoff_multiplier",
                format!("must be a finite value >= 1, got {}", self.backoff_multiplier),
            ));
        }
        Ok(())
    }

    pub(crate) fn validate_refresh_threshold(&self) -> StreamResult<()> {
        if self.full_refresh_threshold.is_zero() {
            return Err(StreamError::invalid_parameter(
                "full_refresh_threshold",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Whole milliseconds in `value`, saturating at `u64::MAX`.
pub fn millis_u64(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(super::millis_u64(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
