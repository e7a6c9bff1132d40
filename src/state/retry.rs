// src/state/retry.rs

//! Retry decisions and exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dag::Task;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Longest delay a retry is ever scheduled with. Retry timers live on a
/// `DelayQueue`, which rejects deadlines beyond roughly two years.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Backoff parameters shared by every task of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Upper bound on the exponential term. Jitter is added on top.
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    /// A task with `max_retries = N` runs at most `N + 1` times.
    pub fn should_retry(&self, task: &Task, attempt: u32) -> bool {
        attempt <= task.max_retries
    }

    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.policy
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.policy.max_delay)
    }

    /// Backoff plus a jitter drawn uniformly from `[0, base_delay)`,
    /// never more than [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let base_ms = u64::try_from(self.policy.base_delay.as_millis()).unwrap_or(u64::MAX);
        if !self.policy.jitter || base_ms == 0 {
            return backoff.min(MAX_RETRY_DELAY);
        }
        let jitter = rand::rng().random_range(0..base_ms);
        backoff
            .saturating_add(Duration::from_millis(jitter))
            .min(MAX_RETRY_DELAY)
    }
}
