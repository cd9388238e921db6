//! Circuit breaker guarding the external catalog.
//!
//! State lives in the shared store under one key per dependency, so every
//! worker process sees the same breaker. Tenants do not get their own
//! breaker: an outage is a property of the dependency.

mod state;

pub use state::{Admission, BreakerSettings, CircuitRecord, CircuitState};

use crate::clock::Clock;
use crate::metrics;
use crate::shared_state::{ResourceKind, SharedStateStore, StateKey, StateUpdate};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Breaker records are refreshed on every write; an untouched closed
/// breaker may quietly expire.
const CIRCUIT_STATE_TTL: Duration = Duration::from_secs(24 * 3600);

/// How an operation's error affects the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, 5xx and rate-limit rejections: counts toward opening.
    Dependency,
    /// Caller-side problems such as validation errors: leaves the breaker
    /// untouched.
    Neutral,
}

pub trait ClassifyFailure {
    fn failure_kind(&self) -> FailureKind;
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker for {dependency} is open, retry in {retry_in:?}")]
    Open {
        dependency: String,
        retry_in: Duration,
    },
    #[error("circuit breaker state unavailable: {0}")]
    State(#[source] anyhow::Error),
    #[error(transparent)]
    Inner(E),
}

pub struct CircuitBreaker {
    dependency: String,
    key: StateKey,
    store: Arc<dyn SharedStateStore>,
    clock: Arc<dyn Clock>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(
        dependency: &str,
        store: Arc<dyn SharedStateStore>,
        clock: Arc<dyn Clock>,
        settings: BreakerSettings,
    ) -> Self {
        Self {
            dependency: dependency.to_string(),
            key: StateKey::new(ResourceKind::Circuit, dependency),
            store,
            clock,
            settings,
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Runs `transition` on the stored record atomically, then logs and
    /// counts any state change.
    fn transition<R>(
        &self,
        mut transition: impl FnMut(&CircuitRecord, i64) -> (CircuitRecord, R),
    ) -> Result<(CircuitRecord, R)> {
        let now_ms = self.clock.now_ms();
        let mut outcome: Option<(CircuitRecord, CircuitRecord, R)> = None;

        self.store
            .compare_and_update(&self.key, now_ms, CIRCUIT_STATE_TTL, &mut |current| {
                let before = current
                    .and_then(|raw| serde_json::from_str::<CircuitRecord>(raw).ok())
                    .unwrap_or_default();
                let (after, result) = transition(&before, now_ms);
                let update = if after == before && current.is_some() {
                    StateUpdate::Keep
                } else {
                    match serde_json::to_string(&after) {
                        Ok(encoded) => StateUpdate::Put(encoded),
                        Err(_) => StateUpdate::Keep,
                    }
                };
                outcome = Some((before, after, result));
                update
            })?;

        let (before, after, result) =
            outcome.ok_or_else(|| anyhow::anyhow!("Breaker update for {} did not run", self.key))?;
        if before.state != after.state {
            self.log_transition(&before, &after);
        }
        Ok((after, result))
    }

    fn log_transition(&self, before: &CircuitRecord, after: &CircuitRecord) {
        metrics::record_breaker_transition(
            &self.dependency,
            before.state.as_str(),
            after.state.as_str(),
            after.state.gauge_value(),
        );
        match after.state {
            CircuitState::Open => error!(
                "Circuit breaker for {} OPEN after {} consecutive failures ({} -> open)",
                self.dependency,
                after.consecutive_failures,
                before.state.as_str()
            ),
            CircuitState::HalfOpen => info!(
                "Circuit breaker for {} HALF_OPEN, admitting trial calls",
                self.dependency
            ),
            CircuitState::Closed => info!(
                "Circuit breaker for {} CLOSED ({} -> closed)",
                self.dependency,
                before.state.as_str()
            ),
        }
    }

    /// Asks for permission to start a call. Callers that get
    /// [`Admission::Allowed`] must report the outcome through
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`record_neutral`](Self::record_neutral).
    pub fn try_acquire(&self) -> Result<Admission> {
        let settings = &self.settings;
        let (_, admission) = self.transition(|record, now_ms| record.admit(now_ms, settings))?;
        if let Admission::Rejected { .. } = admission {
            metrics::record_breaker_rejection(&self.dependency);
        }
        Ok(admission)
    }

    pub fn record_success(&self) -> Result<CircuitState> {
        let settings = &self.settings;
        let (record, _) = self.transition(|record, _| (record.on_success(settings), ()))?;
        Ok(record.state)
    }

    pub fn record_failure(&self) -> Result<CircuitState> {
        let settings = &self.settings;
        let (record, _) =
            self.transition(|record, now_ms| (record.on_failure(now_ms, settings), ()))?;
        Ok(record.state)
    }

    pub fn record_neutral(&self) -> Result<CircuitState> {
        let (record, _) = self.transition(|record, _| (record.on_neutral(), ()))?;
        Ok(record.state)
    }

    /// Runs `operation` unless the breaker is open.
    ///
    /// When open, the operation is never started and
    /// [`BreakerError::Open`] is returned. Otherwise the operation's outcome
    /// is recorded and its own error is handed back as
    /// [`BreakerError::Inner`].
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        E: ClassifyFailure,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.try_acquire().map_err(BreakerError::State)? {
            Admission::Allowed => {}
            Admission::Rejected { retry_in } => {
                return Err(BreakerError::Open {
                    dependency: self.dependency.clone(),
                    retry_in,
                })
            }
        }

        let mut pending = PendingOutcome {
            breaker: self,
            armed: true,
        };
        let result = operation().await;
        pending.armed = false;
        let recorded = match &result {
            Ok(_) => self.record_success(),
            Err(err) => match err.failure_kind() {
                FailureKind::Dependency => self.record_failure(),
                FailureKind::Neutral => self.record_neutral(),
            },
        };
        if let Err(err) = recorded {
            warn!(
                "Failed to record call outcome for {}: {:#}",
                self.dependency, err
            );
        }
        result.map_err(BreakerError::Inner)
    }

    /// Current record; a dependency that was never seen reads as closed.
    pub fn snapshot(&self) -> Result<CircuitRecord> {
        let raw = self.store.get(&self.key, self.clock.now_ms())?;
        Ok(raw
            .and_then(|r| serde_json::from_str(&r).ok())
            .unwrap_or_default())
    }

    /// Forces the breaker closed.
    pub fn reset(&self) -> Result<()> {
        let before = self.snapshot()?;
        self.store.delete(&self.key, self.clock.now_ms())?;
        if before.state != CircuitState::Closed {
            self.log_transition(&before, &CircuitRecord::default());
        }
        info!("Circuit breaker for {} manually reset", self.dependency);
        Ok(())
    }
}

/// Releases the admitted call's slot when its future is dropped before
/// the outcome is known.
struct PendingOutcome<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.breaker.record_neutral() {
            warn!(
                "Failed to release abandoned call for {}: {:#}",
                self.breaker.dependency, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shared_state::InMemorySharedStateStore;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Down,
        BadInput,
    }

    impl ClassifyFailure for TestError {
        fn failure_kind(&self) -> FailureKind {
            match self {
                TestError::Down => FailureKind::Dependency,
                TestError::BadInput => FailureKind::Neutral,
            }
        }
    }

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::new(
            "catalog",
            Arc::new(InMemorySharedStateStore::new()),
            clock.clone(),
            BreakerSettings::default(),
        );
        (clock, breaker)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<TestError>> {
        breaker.call(|| async { Err::<(), _>(TestError::Down) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<TestError>> {
        breaker.call(|| async { Ok::<_, TestError>(7) }).await
    }

    #[tokio::test]
    async fn test_call_passes_through_when_closed() {
        let (_clock, breaker) = breaker();
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.snapshot().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_inner_error_is_returned() {
        let (_clock, breaker) = breaker();
        let err = fail(&breaker).await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner(TestError::Down)));
        assert_eq!(breaker.snapshot().unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_never_runs_operation() {
        let (_clock, breaker) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.snapshot().unwrap().state, CircuitState::Open);

        let mut ran = false;
        let result = breaker
            .call(|| {
                ran = true;
                async { Ok::<_, TestError>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_count() {
        let (_clock, breaker) = breaker();
        for _ in 0..20 {
            let _ = breaker
                .call(|| async { Err::<(), _>(TestError::BadInput) })
                .await;
        }
        let record = breaker.snapshot().unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(60));

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.snapshot().unwrap().state, CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.snapshot().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_trial_calls_release_their_slots() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(61));

        for _ in 0..2 {
            let hung = breaker.call(|| async {
                std::future::pending::<()>().await;
                Ok::<_, TestError>(())
            });
            let timed_out = tokio::time::timeout(Duration::from_millis(5), hung).await;
            assert!(timed_out.is_err());
        }
        let record = breaker.snapshot().unwrap();
        assert_eq!(record.state, CircuitState::HalfOpen);
        assert_eq!(record.trials_in_flight, 0);

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.snapshot().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unreported_trials_expire_after_timeout() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure().unwrap();
        }
        clock.advance(Duration::from_secs(61));
        // Two trials admitted by workers that never report back.
        assert_eq!(breaker.try_acquire().unwrap(), Admission::Allowed);
        assert_eq!(breaker.try_acquire().unwrap(), Admission::Allowed);
        assert!(matches!(
            breaker.try_acquire().unwrap(),
            Admission::Rejected { .. }
        ));

        clock.advance(Duration::from_secs(6 * 3600));
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.snapshot().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breakers_share_state_through_store() {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn SharedStateStore> = Arc::new(InMemorySharedStateStore::new());
        let a = CircuitBreaker::new("catalog", store.clone(), clock.clone(), Default::default());
        let b = CircuitBreaker::new("catalog", store.clone(), clock.clone(), Default::default());
        let other = CircuitBreaker::new("payments", store, clock, Default::default());

        for _ in 0..5 {
            a.record_failure().unwrap();
        }
        assert_eq!(b.snapshot().unwrap().state, CircuitState::Open);
        assert_eq!(other.snapshot().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let (_clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure().unwrap();
        }
        breaker.reset().unwrap();
        assert_eq!(breaker.snapshot().unwrap(), CircuitRecord::default());
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }
}
