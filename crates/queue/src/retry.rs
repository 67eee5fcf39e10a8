//! Retry and deferral policy.

use std::time::Duration;

use scholar_common::RetrySettings;

/// Backoff policy applied when a job is pushed back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt budget for jobs submitted without one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Delay after the provider throttled us.
    pub throttle_delay: Duration,
    /// Times provider throttling may defer a job without using an attempt.
    /// Rate limiter deferrals are not counted against it.
    pub max_deferrals: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            throttle_delay: Duration::from_secs(settings.throttle_delay_secs),
            max_deferrals: settings.max_deferrals,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempts` completed attempts
    /// (0-indexed): `base_delay * 2^attempts`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        2_u32
            .checked_pow(attempts)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether a job already deferred `throttle_deferrals` times for
    /// provider throttling may be deferred again.
    #[must_use]
    pub const fn can_defer(&self, throttle_deferrals: u32) -> bool {
        throttle_deferrals < self.max_deferrals
    }
}
