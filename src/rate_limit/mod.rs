mod adaptive;
mod token_bucket;

pub use adaptive::{AdaptiveLimitController, AdaptiveSettings};
pub use token_bucket::{
    AcquireDecision, BucketRecord, TokenBucket, DEFAULT_CAPACITY, DEFAULT_REFILL_WINDOW,
};

use anyhow::Result;
use serde::Serialize;

/// Where an account stands with the shared limiter right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStatus {
    pub account_id: String,
    /// Absent when the account has not called in the current window.
    pub bucket: Option<BucketRecord>,
    pub multiplier: f64,
    pub effective_capacity: u64,
}

/// Token bucket sized by the adaptive controller. This is what the call
/// gate talks to.
pub struct AccountRateLimiter {
    bucket: TokenBucket,
    controller: AdaptiveLimitController,
}

impl AccountRateLimiter {
    pub fn new(bucket: TokenBucket, controller: AdaptiveLimitController) -> Self {
        Self { bucket, controller }
    }

    pub fn acquire(&self, account_id: &str, cost: u64) -> Result<AcquireDecision> {
        let capacity = self.controller.effective_capacity(account_id)?;
        self.bucket.acquire(account_id, cost, capacity)
    }

    pub fn report_outcome(&self, account_id: &str, was_throttled: bool) -> Result<f64> {
        self.controller.report_outcome(account_id, was_throttled)
    }

    pub fn multiplier(&self, account_id: &str) -> Result<f64> {
        self.controller.multiplier(account_id)
    }

    pub fn effective_capacity(&self, account_id: &str) -> Result<u64> {
        self.controller.effective_capacity(account_id)
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn status(&self, account_id: &str) -> Result<LimitStatus> {
        Ok(LimitStatus {
            account_id: account_id.to_string(),
            bucket: self.bucket.peek(account_id)?,
            multiplier: self.controller.multiplier(account_id)?,
            effective_capacity: self.controller.effective_capacity(account_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::shared_state::InMemorySharedStateStore;
    use std::sync::Arc;

    #[test]
    fn test_status_reflects_spent_tokens_and_feedback() {
        let store = Arc::new(InMemorySharedStateStore::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = AccountRateLimiter::new(
            TokenBucket::new(store.clone(), clock.clone(), DEFAULT_REFILL_WINDOW),
            AdaptiveLimitController::new(store, clock.clone(), AdaptiveSettings::default()),
        );

        let idle = limiter.status("acct").unwrap();
        assert_eq!(idle.bucket, None);
        assert_eq!(idle.effective_capacity, DEFAULT_CAPACITY);

        for _ in 0..5 {
            assert!(limiter.acquire("acct", 1).unwrap().allowed);
        }
        limiter.report_outcome("acct", true).unwrap();

        let status = limiter.status("acct").unwrap();
        let bucket = status.bucket.unwrap();
        assert_eq!(bucket.tokens, DEFAULT_CAPACITY - 5);
        assert_eq!(bucket.refill_at_ms, clock.now_ms() + DEFAULT_REFILL_WINDOW.as_millis() as i64);
        assert!(status.multiplier < 1.0);
        assert!(status.effective_capacity < DEFAULT_CAPACITY);
    }
}
