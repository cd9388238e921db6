use crate::clock::Clock;
use crate::metrics;
use crate::shared_state::{ResourceKind, SharedStateStore, StateKey, StateUpdate};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for the throttling feedback loop.
#[derive(Debug, Clone)]
pub struct AdaptiveSettings {
    pub base_capacity: u64,
    pub floor: f64,
    pub ceiling: f64,
    /// Applied on every throttled response.
    pub shrink: f64,
    /// Applied on every non-throttled response.
    pub grow: f64,
    /// Unused multipliers expire and the account falls back to neutral.
    pub ttl: Duration,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            base_capacity: super::DEFAULT_CAPACITY,
            floor: 0.5,
            ceiling: 1.5,
            shrink: 0.9,
            grow: 1.01,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Scales each account's bucket capacity from throttling feedback: shrinks
/// fast on a 429, grows slowly on success, always within
/// `[floor, ceiling]`.
pub struct AdaptiveLimitController {
    store: Arc<dyn SharedStateStore>,
    clock: Arc<dyn Clock>,
    settings: AdaptiveSettings,
}

impl AdaptiveLimitController {
    pub fn new(
        store: Arc<dyn SharedStateStore>,
        clock: Arc<dyn Clock>,
        settings: AdaptiveSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &AdaptiveSettings {
        &self.settings
    }

    fn parse(&self, raw: Option<&str>) -> f64 {
        raw.and_then(|v| v.parse::<f64>().ok())
            .filter(|m| m.is_finite())
            .map(|m| m.clamp(self.settings.floor, self.settings.ceiling))
            .unwrap_or(1.0)
    }

    /// Folds one external response into the account's multiplier and
    /// returns the new value.
    pub fn report_outcome(&self, account_id: &str, was_throttled: bool) -> Result<f64> {
        let key = StateKey::new(ResourceKind::AdaptiveMultiplier, account_id);
        let mut previous = 1.0;
        let mut next = 1.0;

        self.store.compare_and_update(
            &key,
            self.clock.now_ms(),
            self.settings.ttl,
            &mut |current| {
                previous = self.parse(current);
                next = if was_throttled {
                    (previous * self.settings.shrink).max(self.settings.floor)
                } else {
                    (previous * self.settings.grow).min(self.settings.ceiling)
                };
                StateUpdate::Put(next.to_string())
            },
        )?;

        metrics::set_rate_limit_multiplier(account_id, next);
        if was_throttled {
            metrics::record_throttled_response(account_id);
            warn!(
                "Throttled by external API for account {}: multiplier {:.3} -> {:.3}, capacity {}",
                account_id,
                previous,
                next,
                self.capacity_for(next)
            );
        } else if next != previous {
            debug!(
                "Multiplier for account {} recovered {:.3} -> {:.3}",
                account_id, previous, next
            );
        }
        Ok(next)
    }

    /// Current multiplier; 1.0 when the account has no live record.
    pub fn multiplier(&self, account_id: &str) -> Result<f64> {
        let key = StateKey::new(ResourceKind::AdaptiveMultiplier, account_id);
        let raw = self.store.get(&key, self.clock.now_ms())?;
        Ok(self.parse(raw.as_deref()))
    }

    /// Base capacity scaled by the current multiplier, rounded down and
    /// never below one token.
    pub fn effective_capacity(&self, account_id: &str) -> Result<u64> {
        Ok(self.capacity_for(self.multiplier(account_id)?))
    }

    fn capacity_for(&self, multiplier: f64) -> u64 {
        ((self.settings.base_capacity as f64 * multiplier).floor() as u64).max(1)
    }
}
