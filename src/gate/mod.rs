//! Outbound call gate: the only way to reach the external catalog.
//!
//! Every call takes a token from the account's bucket, passes the circuit
//! breaker, runs under a request timeout and reports its outcome back to the
//! breaker and the adaptive limit controller.

use crate::catalog_api::{ApiError, CatalogApi, OutboundCall};
use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::metrics;
use crate::rate_limit::AccountRateLimiter;
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub request_timeout: Duration,
    /// Attempts per call when the dependency is failing (first try included).
    pub max_attempts: u32,
    /// How many times one call may sleep on an empty bucket or a 429 before
    /// giving up with [`GateError::Throttled`].
    pub max_throttle_waits: u32,
    /// Backoff between attempts after dependency failures.
    pub backoff: RetryPolicy,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(180),
            max_attempts: 3,
            max_throttle_waits: 3,
            backoff: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                jitter: 0.25,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("rate budget for account {account_id} exhausted, retry in {wait:?}")]
    Throttled { account_id: String, wait: Duration },
    #[error("circuit breaker open for {dependency}, retry in {retry_in:?}")]
    BreakerOpen {
        dependency: String,
        retry_in: Duration,
    },
    #[error("external catalog unavailable: {0}")]
    DependencyDown(String),
    #[error("request rejected by external catalog: {0}")]
    Validation(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ApiError },
    #[error("shared rate-limit state unavailable: {0:#}")]
    Limiter(#[source] anyhow::Error),
}

pub struct OutboundGate {
    api: Arc<dyn CatalogApi>,
    limiter: Arc<AccountRateLimiter>,
    breaker: Arc<CircuitBreaker>,
    settings: GateSettings,
}

impl OutboundGate {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        limiter: Arc<AccountRateLimiter>,
        breaker: Arc<CircuitBreaker>,
        settings: GateSettings,
    ) -> Self {
        Self {
            api,
            limiter,
            breaker,
            settings,
        }
    }

    pub fn limiter(&self) -> &AccountRateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Waits for a token, sleeping on denial. Each sleep spends one of the
    /// call's throttle waits.
    async fn take_token(&self, account_id: &str, throttle_waits: &mut u32) -> Result<(), GateError> {
        loop {
            let decision = self
                .limiter
                .acquire(account_id, 1)
                .map_err(GateError::Limiter)?;
            if decision.allowed {
                return Ok(());
            }
            metrics::record_rate_limit_denial(account_id);
            if *throttle_waits >= self.settings.max_throttle_waits {
                return Err(GateError::Throttled {
                    account_id: account_id.to_string(),
                    wait: decision.wait,
                });
            }
            *throttle_waits += 1;
            debug!(
                "Waiting {:.3}s for a token for account {}",
                decision.wait_seconds(),
                account_id
            );
            tokio::time::sleep(decision.wait).await;
        }
    }

    /// Sends `call` to the external catalog.
    ///
    /// Throttling and dependency failures are retried within the configured
    /// bounds; validation errors and an open breaker return at once.
    pub async fn call(&self, call: OutboundCall) -> Result<Value, GateError> {
        let operation = call.operation.as_str();
        let account_id = call.account_id.as_str();
        let mut throttle_waits = 0u32;
        let mut failures = 0u32;

        loop {
            self.take_token(account_id, &mut throttle_waits).await?;

            let started = Instant::now();
            let timeout = self.settings.request_timeout;
            let api = &self.api;
            let call_ref = &call;
            let result = self
                .breaker
                .call(|| async move {
                    match tokio::time::timeout(timeout, api.execute(call_ref)).await {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::DependencyDown(format!(
                            "{} timed out after {:?}",
                            call_ref.operation.as_str(),
                            timeout
                        ))),
                    }
                })
                .await;
            let elapsed = started.elapsed();

            match result {
                Ok(value) => {
                    metrics::record_outbound_call(operation, "ok", elapsed);
                    if let Err(err) = self.limiter.report_outcome(account_id, false) {
                        warn!("Failed to record success for {}: {:#}", account_id, err);
                    }
                    return Ok(value);
                }
                Err(BreakerError::Open {
                    dependency,
                    retry_in,
                }) => {
                    metrics::record_outbound_call(operation, "breaker_open", elapsed);
                    return Err(GateError::BreakerOpen {
                        dependency,
                        retry_in,
                    });
                }
                Err(BreakerError::State(err)) => return Err(GateError::Limiter(err)),
                Err(BreakerError::Inner(ApiError::Validation(message))) => {
                    metrics::record_outbound_call(operation, "validation", elapsed);
                    return Err(GateError::Validation(message));
                }
                Err(BreakerError::Inner(ApiError::Throttled { retry_after })) => {
                    metrics::record_outbound_call(operation, "throttled", elapsed);
                    self.limiter
                        .report_outcome(account_id, true)
                        .map_err(GateError::Limiter)?;
                    let wait = retry_after.unwrap_or_else(|| self.limiter.bucket().window());
                    if throttle_waits >= self.settings.max_throttle_waits {
                        return Err(GateError::Throttled {
                            account_id: account_id.to_string(),
                            wait,
                        });
                    }
                    throttle_waits += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(BreakerError::Inner(err @ ApiError::DependencyDown(_))) => {
                    metrics::record_outbound_call(operation, "dependency_down", elapsed);
                    failures += 1;
                    if failures >= self.settings.max_attempts {
                        return Err(if failures == 1 {
                            GateError::DependencyDown(err.to_string())
                        } else {
                            GateError::RetriesExhausted {
                                attempts: failures,
                                last: err,
                            }
                        });
                    }
                    let delay = self.settings.backoff.delay(failures - 1);
                    warn!(
                        "{} for account {} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, account_id, failures, self.settings.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
