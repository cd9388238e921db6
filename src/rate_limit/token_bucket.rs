//! Fixed-window token bucket shared by every worker.
//!
//! The external catalog enforces a per-account budget that resets in full at
//! each window boundary, so this bucket does the same instead of trickling
//! tokens back continuously.

use crate::clock::Clock;
use crate::shared_state::{ResourceKind, SharedStateStore, StateKey, StateUpdate};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: u64 = 200;
pub const DEFAULT_REFILL_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub tokens: u64,
    /// When the current window ends and the bucket refills (ms since epoch).
    pub refill_at_ms: i64,
}

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireDecision {
    pub allowed: bool,
    /// Time until the next window boundary when denied; zero when allowed.
    pub wait: Duration,
    pub remaining: u64,
}

impl AcquireDecision {
    pub fn wait_seconds(&self) -> f64 {
        self.wait.as_secs_f64()
    }
}

pub struct TokenBucket {
    store: Arc<dyn SharedStateStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn SharedStateStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            store,
            clock,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Takes `cost` tokens from the account's bucket if the current window
    /// still holds them.
    ///
    /// `capacity` is the account's effective capacity for this call. When it
    /// has shrunk since the window opened, the remaining tokens are clamped
    /// to it; when it has grown, the extra tokens only arrive at the next
    /// refill.
    pub fn acquire(&self, account_id: &str, cost: u64, capacity: u64) -> Result<AcquireDecision> {
        if cost > capacity {
            bail!(
                "Cost {} exceeds bucket capacity {} for account {}",
                cost,
                capacity,
                account_id
            );
        }

        let key = StateKey::new(ResourceKind::TokenBucket, account_id);
        let now_ms = self.clock.now_ms();
        let window_ms = self.window.as_millis() as i64;
        let mut decision = AcquireDecision {
            allowed: false,
            wait: Duration::ZERO,
            remaining: 0,
        };

        self.store.compare_and_update(
            &key,
            now_ms,
            self.window * 2,
            &mut |current| {
                let stored = current.and_then(|raw| match serde_json::from_str::<BucketRecord>(raw) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!("Discarding unreadable bucket state for {}: {}", key, err);
                        None
                    }
                });

                let mut record = match stored {
                    Some(record) if now_ms < record.refill_at_ms => record,
                    _ => BucketRecord {
                        tokens: capacity,
                        refill_at_ms: now_ms + window_ms,
                    },
                };
                record.tokens = record.tokens.min(capacity);

                if record.tokens >= cost {
                    record.tokens -= cost;
                    decision = AcquireDecision {
                        allowed: true,
                        wait: Duration::ZERO,
                        remaining: record.tokens,
                    };
                } else {
                    decision = AcquireDecision {
                        allowed: false,
                        wait: Duration::from_millis((record.refill_at_ms - now_ms).max(0) as u64),
                        remaining: record.tokens,
                    };
                }

                match serde_json::to_string(&record) {
                    Ok(encoded) => StateUpdate::Put(encoded),
                    Err(_) => StateUpdate::Keep,
                }
            },
        )?;

        if !decision.allowed {
            debug!(
                "Token denied for account {} (capacity {}), retry in {:.3}s",
                account_id,
                capacity,
                decision.wait_seconds()
            );
        }
        Ok(decision)
    }

    /// Current bucket record, if the account has one that has not expired.
    pub fn peek(&self, account_id: &str) -> Result<Option<BucketRecord>> {
        let key = StateKey::new(ResourceKind::TokenBucket, account_id);
        let raw = self.store.get(&key, self.clock.now_ms())?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }
}
