//! Circuit Breaker Module
//!
//! Consecutive-failure circuit breaker: closed until `failure_threshold`
//! transient failures in a row, then open for `break_duration`, then half-open
//! with a single trial call admitted.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

// == Circuit State ==
/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { open_until: Instant },
    HalfOpen { trial_in_flight: bool },
}

// == Circuit Breaker ==
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    failure_threshold: u32,
    break_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, break_duration: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            break_duration,
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Asks to run a call. `Err` carries how long the circuit stays open.
    ///
    /// The returned permit must be settled with [`CallPermit::succeeded`] or
    /// [`CallPermit::failed`]. A half-open trial permit dropped unsettled
    /// (timeout, cancellation, dropped caller) re-arms the circuit so the
    /// next call is admitted as a fresh trial.
    pub fn try_enter(&self) -> Result<CallPermit<'_>, Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        let trial = match &mut *state {
            State::Closed { .. } => false,
            State::Open { open_until } => {
                if now < *open_until {
                    return Err(*open_until - now);
                }
                info!("Circuit half-open, admitting trial call");
                *state = State::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            State::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    return Err(Duration::ZERO);
                }
                *trial_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if matches!(*state, State::HalfOpen { .. }) {
            info!("Circuit closed after successful trial call");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        break_duration = ?self.break_duration,
                        "Circuit opened"
                    );
                    *state = State::Open {
                        open_until: now + self.break_duration,
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(break_duration = ?self.break_duration, "Trial call failed, circuit reopened");
                *state = State::Open {
                    open_until: now + self.break_duration,
                };
            }
            // a call admitted before the circuit opened; nothing to update
            State::Open { .. } => {}
        }
    }

    /// Puts an abandoned half-open trial back to an expired open state.
    fn abandon_trial(&self) {
        let mut state = self.lock();
        if matches!(*state, State::HalfOpen { trial_in_flight: true }) {
            debug!("Trial call abandoned, circuit ready for another attempt");
            *state = State::Open {
                open_until: Instant::now(),
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// == Call Permit ==
/// Admission to run one call through the breaker.
#[derive(Debug)]
#[must_use = "an unsettled permit counts as an abandoned call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    /// Admitted while half-open
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_enter().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_enter().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial_call() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(11)).await;

        let permit = breaker.try_enter().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_enter().is_err(), "second trial call must be rejected");
        permit.succeeded();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_outcome_decides_state() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        breaker.try_enter().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.try_enter().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_does_not_wedge_circuit() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        drop(breaker.try_enter().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);

        let retrial = breaker.try_enter().expect("next call is admitted right away");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        retrial.succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_closed_permit_changes_nothing() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure();

        drop(breaker.try_enter().unwrap());
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_remaining_open_time() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(breaker.try_enter().err(), Some(Duration::from_secs(6)));
    }
}
