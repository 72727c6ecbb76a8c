//! Retry policy for failed job attempts.
//!
//! Exponential backoff capped at a maximum delay, with symmetric random
//! jitter so that jobs failing together do not retry together.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::{Job, saturating_offset};

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at `next_at`.
    Retry { next_at: DateTime<Utc> },
    /// No attempts left.
    Exhausted,
}

/// Backoff configuration shared by all jobs of a dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay unit; the first retry waits `base_delay * 2`.
    #[serde(with = "serde_duration")]
    pub base_delay: Duration,

    /// Upper bound on the un-jittered delay.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,

    /// Fraction of the delay added or removed at random (0.0 - 1.0).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Create a policy without jitter.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// A policy that retries immediately. Useful in tests.
    pub fn immediate() -> Self {
        Self::exponential(Duration::ZERO, Duration::ZERO)
    }

    /// Builder: set the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Decide whether the job's failed attempt gets another try.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        if job.attempt >= job.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            next_at: saturating_offset(now, self.delay_for_attempt(job.attempt)),
        }
    }

    /// Delay before the retry that follows `attempt`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        apply_jitter(self.backoff(attempt), self.jitter)
    }

    /// Un-jittered delay: `min(base_delay * 2^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(3600)).with_jitter(0.2)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
    let range = (delay_ms as f64 * jitter).floor() as u64;
    if range == 0 {
        return delay;
    }

    let mut rng = rand::rng();
    let offset = rng.random_range(0..=range);
    let jittered = if rng.random_bool(0.5) {
        delay_ms.saturating_add(offset)
    } else {
        delay_ms.saturating_sub(offset)
    };
    Duration::from_millis(jittered)
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole seconds (matching the YAML config format).
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
