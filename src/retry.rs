//! Retry policy shared by the call gate and the bulk sync engine.
//!
//! Exponential backoff with a cap and optional jitter. Callers drive the
//! loop themselves; this only answers "may I retry?" and "how long do I
//! wait?".

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Cap for exponential growth.
    pub max_backoff: Duration,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
    /// Fraction of the backoff that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff before retry number `retry_count` (zero-based), without
    /// jitter: `initial * multiplier^retry_count`, capped at `max_backoff`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let millis = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(retry_count.min(i32::MAX as u32) as i32);
        let capped = millis.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// [`backoff`](Self::backoff) minus a random share of up to `jitter`,
    /// so concurrent retriers do not wake in lockstep.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base = self.backoff(retry_count);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let shave = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 - shave)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
