//! Retry settings and backoff policies for transform attempts.
//!
//! Every attempt is its own node state in the ledger, so the processor drives
//! the loop itself and asks [`RetrySettings::next_delay`] whether another
//! attempt is allowed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracery_types::TraceryError;

use crate::config::duration_serde;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed {
        #[serde(with = "duration_serde")]
        delay: Duration,
    },
    /// Exponential backoff: base * 2^retry, capped at max.
    Exponential {
        #[serde(with = "duration_serde")]
        base: Duration,
        #[serde(with = "duration_serde")]
        max: Duration,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay before retry number `retry` (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(retry));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetrySettings {
    pub fn attempts(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Delay before the next attempt, or `None` when `attempt` (1-based) was
    /// the last one allowed for `error`.
    pub fn next_delay(&self, attempt: u32, error: &TraceryError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        Some(self.backoff.delay_for_attempt(attempt - 1))
    }
}
