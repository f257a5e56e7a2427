//! Retry/timeout policy attached to every submitted job.
//!
//! The policy object is the single source of truth for timeout and retry
//! behavior; UI dialogs derive their fields from it, never the reverse.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound for a single backoff delay.
const MAX_BACKOFF_SECS: f64 = 10.0;

/// Growth factor between consecutive retry delays.
const BACKOFF_GROWTH: f64 = 1.6;

/// Upper bound for the jitter fraction.
const MAX_JITTER: f64 = 0.9;

/// Execution policy for a single job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPolicy {
    /// Budget for one attempt, measured on the monotonic clock.
    /// `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Additional attempts allowed after the first failure. Only
    /// infrastructure failures are retried.
    pub max_retries: u32,
    /// Base delay before the first retry; later retries grow exponentially.
    pub retry_backoff: Duration,
    /// Fractional jitter applied to each delay (`delay * (1 ± jitter)`).
    pub retry_jitter: f64,
    /// Total budget across all attempts. Once exceeded, no further retries
    /// are scheduled even if `max_retries` remain.
    pub retry_deadline: Option<Duration>,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries: 0,
            retry_backoff: Duration::from_millis(750),
            retry_jitter: 0.3,
            retry_deadline: None,
        }
    }
}

impl JobPolicy {
    /// Convenience constructor for a policy with only a timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Total number of attempts, always at least 1.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to sleep before re-running after failed attempt number
    /// `attempt` (1-based).
    ///
    /// Exponential growth capped at 10 s, multiplied by `1 ± jitter` with
    /// the jitter fraction clamped to 0.9. Never negative.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let base = (self.retry_backoff.as_secs_f64() * BACKOFF_GROWTH.powi(exponent))
            .min(MAX_BACKOFF_SECS);
        let jitter = if self.retry_jitter <= 0.0 {
            0.0
        } else {
            self.retry_jitter.min(MAX_JITTER)
        };
        let factor = if jitter == 0.0 {
            1.0
        } else {
            1.0 + rand::rng().random_range(-jitter..=jitter)
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}
