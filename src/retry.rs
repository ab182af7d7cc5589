//! Retry policy for step attempts
//!
//! Mirrors the shape of the teacher crate's `RetryPolicy` (exponential
//! backoff, builder-style setters, millisecond-precision `Duration`
//! serialization) but matches this engine's retry-gating rule: an optional
//! allow-list of error-message substrings, rather than a deny-list of error
//! *types*. An empty allow-list means every failure is retryable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a step's per-attempt retry behavior.
///
/// # Example
///
/// ```
/// use durable_flow::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_millis(1))
///     .with_multiplier(2.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. `1` means no retry.
    pub max_attempts: u32,

    /// Delay before the first retry (attempt index 1).
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Ceiling on the backoff delay, regardless of `multiplier`.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Exponential backoff multiplier. `1.0` yields constant backoff.
    pub multiplier: f64,

    /// Error-message substrings that gate retry. Empty means every failure
    /// is retryable.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// A policy allowing exactly one attempt (no retry).
    ///
    /// This is the default when a step declares no retry policy at all, per
    /// the "empty retry policy defaults to exactly one attempt" boundary
    /// behavior.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            retryable_errors: vec![],
        }
    }

    /// An exponential-backoff policy with sensible defaults: 3 attempts,
    /// 100ms initial interval, 30s max interval, 2x multiplier.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            retryable_errors: vec![],
        }
    }

    /// A policy with fixed (non-growing) retry intervals.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_retryable_error(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_errors.push(pattern.into());
        self
    }

    /// Delay to sleep before the attempt at 0-based index `attempt_index`.
    ///
    /// `attempt_index == 0` (the first attempt) never delays. Retry `i`
    /// (`attempt_index == i`, `i >= 1`) delays
    /// `min(initial * multiplier^(i-1), max)`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        if attempt_index == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt_index - 1) as i32;
        let base_secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_secs = base_secs.min(self.max_interval.as_secs_f64());

        Duration::from_secs_f64(capped_secs.max(0.0))
    }

    /// Whether a failure whose message is `error_message` may be retried,
    /// per the allow-list rule (empty list = always retryable).
    pub fn is_retryable(&self, error_message: &str) -> bool {
        self.retryable_errors.is_empty()
            || self
                .retryable_errors
                .iter()
                .any(|pattern| error_message.contains(pattern.as_str()))
    }

    /// Whether another attempt remains after `attempts_made` attempts.
    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
