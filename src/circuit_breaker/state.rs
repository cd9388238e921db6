//! Breaker record and its transition functions.
//!
//! The functions here are pure: they take a record and the current time and
//! return the next record. The breaker applies them inside one shared-state
//! compare-and-update.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }

    /// Numeric value exported on the breaker state gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    /// Trial calls allowed in flight at once while half-open.
    pub half_open_max_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_trials: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Only meaningful while half-open.
    pub consecutive_successes: u32,
    pub opened_at_ms: Option<i64>,
    pub trials_in_flight: u32,
    /// When the latest half-open trial was admitted. Trials that never
    /// reported back (dropped caller, crashed worker) stop holding their
    /// slot once this is older than the breaker timeout.
    #[serde(default)]
    pub trial_started_at_ms: Option<i64>,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at_ms: None,
            trials_in_flight: 0,
            trial_started_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_in: Duration },
}

impl CircuitRecord {
    fn opened(now_ms: i64, consecutive_failures: u32) -> Self {
        Self {
            state: CircuitState::Open,
            consecutive_failures,
            consecutive_successes: 0,
            opened_at_ms: Some(now_ms),
            trials_in_flight: 0,
            trial_started_at_ms: None,
        }
    }

    /// Decides whether a call may start now. An open breaker whose timeout
    /// has elapsed moves to half-open and admits the caller as a trial.
    pub fn admit(&self, now_ms: i64, settings: &BreakerSettings) -> (CircuitRecord, Admission) {
        match self.state {
            CircuitState::Closed => (self.clone(), Admission::Allowed),
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.unwrap_or(now_ms);
                let reopen_at = opened_at + settings.timeout.as_millis() as i64;
                if now_ms >= reopen_at {
                    let next = CircuitRecord {
                        state: CircuitState::HalfOpen,
                        consecutive_failures: self.consecutive_failures,
                        consecutive_successes: 0,
                        opened_at_ms: self.opened_at_ms,
                        trials_in_flight: 1,
                        trial_started_at_ms: Some(now_ms),
                    };
                    (next, Admission::Allowed)
                } else {
                    let retry_in = Duration::from_millis((reopen_at - now_ms) as u64);
                    (self.clone(), Admission::Rejected { retry_in })
                }
            }
            CircuitState::HalfOpen => {
                let timeout_ms = settings.timeout.as_millis() as i64;
                let stale = self
                    .trial_started_at_ms
                    .map_or(true, |started| now_ms - started >= timeout_ms);
                if stale {
                    // Every outstanding trial is older than the timeout; their
                    // slots are abandoned.
                    let next = CircuitRecord {
                        trials_in_flight: 1,
                        trial_started_at_ms: Some(now_ms),
                        ..self.clone()
                    };
                    (next, Admission::Allowed)
                } else if self.trials_in_flight < settings.half_open_max_trials {
                    let mut next = self.clone();
                    next.trials_in_flight += 1;
                    next.trial_started_at_ms = Some(now_ms);
                    (next, Admission::Allowed)
                } else {
                    (
                        self.clone(),
                        Admission::Rejected {
                            retry_in: Duration::ZERO,
                        },
                    )
                }
            }
        }
    }

    pub fn on_success(&self, settings: &BreakerSettings) -> CircuitRecord {
        match self.state {
            CircuitState::Closed => CircuitRecord::default(),
            // A call admitted before the breaker opened; the open period stands.
            CircuitState::Open => self.clone(),
            CircuitState::HalfOpen => {
                let successes = self.consecutive_successes + 1;
                if successes >= settings.success_threshold {
                    CircuitRecord::default()
                } else {
                    CircuitRecord {
                        consecutive_successes: successes,
                        trials_in_flight: self.trials_in_flight.saturating_sub(1),
                        ..self.clone()
                    }
                }
            }
        }
    }

    pub fn on_failure(&self, now_ms: i64, settings: &BreakerSettings) -> CircuitRecord {
        match self.state {
            CircuitState::Closed => {
                let failures = self.consecutive_failures + 1;
                if failures >= settings.failure_threshold {
                    CircuitRecord::opened(now_ms, failures)
                } else {
                    CircuitRecord {
                        consecutive_failures: failures,
                        ..self.clone()
                    }
                }
            }
            CircuitState::Open => CircuitRecord {
                consecutive_failures: self.consecutive_failures + 1,
                ..self.clone()
            },
            CircuitState::HalfOpen => CircuitRecord::opened(now_ms, self.consecutive_failures + 1),
        }
    }

    /// A call finished with an outcome that says nothing about the
    /// dependency's health. Only frees the trial slot it held.
    pub fn on_neutral(&self) -> CircuitRecord {
        match self.state {
            CircuitState::HalfOpen => CircuitRecord {
                trials_in_flight: self.trials_in_flight.saturating_sub(1),
                ..self.clone()
            },
            _ => self.clone(),
        }
    }
}
