//! # Circuit Breaker
//!
//! Failure-count gate in front of the inference worker.
//!
//! ```text
//! Closed    -> Open:      failure_count reaches failure_threshold
//! Open      -> Half-Open: first can_attempt() after recovery_timeout since the last failure
//! Half-Open -> Closed:    record_success()
//! Half-Open -> Open:      record_failure()
//! ```
//!
//! The breaker never observes calls itself. Callers ask [`CircuitBreaker::can_attempt`]
//! before dispatching and report every outcome, timeouts included, through
//! [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`].
//! Half-Open admits exactly one probe until its outcome is recorded.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, SharedClock, SystemClock};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, a single probe allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that force the circuit open
    pub failure_threshold: u32,
    /// Quiet period after the last failure before a probe is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
}

/// Snapshot of the breaker for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// Thread-safe circuit breaker; every update happens under one lock so
/// compound read-modify-write transitions are atomic.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Name of this circuit breaker (for metrics and logging)
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker backed by the system clock
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    /// Creates a new circuit breaker reading time from `clock`
    pub fn with_clock<S: Into<String>>(name: S, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
                total_failures: 0,
                total_successes: 0,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the guarded call may be attempted right now.
    ///
    /// In `Open` this moves the breaker to `HalfOpen` once the recovery
    /// timeout has elapsed since the last failure.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let since_failure = inner
                    .last_failure
                    .map(|at| elapsed_between(at, self.clock.now()))
                    .unwrap_or(Duration::MAX);

                if since_failure > self.config.recovery_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    true
                } else {
                    debug!(
                        circuit = %self.name,
                        remaining_ms = %self.config.recovery_timeout.saturating_sub(since_failure).as_millis(),
                        "Circuit open, attempt rejected"
                    );
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call: resets the counter and closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
        counter!("circuit_breaker.success", 1, "circuit" => self.name.clone());

        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Records a failed call (error or timeout)
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(self.clock.now());
        inner.probe_in_flight = false;
        counter!("circuit_breaker.failure", 1, "circuit" => self.name.clone());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold;

        if should_open && inner.state != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    /// Records an attempt that never reached the guarded service. Neither
    /// counter moves; a half-open probe slot is handed back.
    pub fn record_abandoned(&self) {
        let mut inner = self.lock();
        if inner.probe_in_flight {
            debug!(circuit = %self.name, "Probe abandoned, slot released");
        }
        inner.probe_in_flight = false;
    }

    /// Get the current circuit state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Get metrics about the circuit breaker
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure: inner.last_failure,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                failure_count = %inner.failure_count,
                threshold = %self.config.failure_threshold,
                "Circuit OPEN: failure threshold reached"
            ),
            CircuitState::HalfOpen => info!(
                circuit = %self.name,
                recovery_timeout_ms = %self.config.recovery_timeout.as_millis(),
                "Circuit HALF-OPEN: admitting a probe"
            ),
            CircuitState::Closed => info!(
                circuit = %self.name,
                previous = %from,
                "Circuit CLOSED: service recovered"
            ),
        }

        counter!("circuit_breaker.transitions", 1, "circuit" => self.name.clone(), "to" => to.to_string());
        gauge!("circuit_breaker.state", to.gauge_value(), "circuit" => self.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn breaker(threshold: u32, recovery: Duration) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cb = CircuitBreaker::with_clock(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
            clock.clone(),
        );
        (cb, clock)
    }

    #[test]
    fn test_circuit_closed_initially() {
        let (cb, _) = breaker(3, Duration::from_secs(10));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let (cb, _) = breaker(3, Duration::from_secs(10));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_open_stays_closed_to_attempts_until_timeout() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        cb.record_failure();

        clock.advance(Duration::from_secs(10));
        assert!(!cb.can_attempt(), "exactly the timeout is not enough");
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let (cb, clock) = breaker(2, Duration::from_secs(5));
        cb.record_failure();
        cb.record_failure();

        clock.advance(Duration::from_secs(6));
        assert!(cb.can_attempt());
        assert!(!cb.can_attempt());
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_full_recovery_cycle() {
        let (cb, clock) = breaker(3, Duration::from_secs(30));
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());

        clock.advance(Duration::from_secs(31));
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_failed_probe_reopens_and_restarts_timer() {
        let (cb, clock) = breaker(1, Duration::from_secs(5));
        cb.record_failure();
        clock.advance(Duration::from_secs(6));
        assert!(cb.can_attempt());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(3));
        assert!(!cb.can_attempt());
        clock.advance(Duration::from_secs(3));
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_abandoned_probe_frees_the_slot_without_counting() {
        let (cb, clock) = breaker(2, Duration::from_secs(5));
        cb.record_failure();
        cb.record_abandoned();
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        clock.advance(Duration::from_secs(6));
        assert!(cb.can_attempt());
        assert!(!cb.can_attempt());

        cb.record_abandoned();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().total_failures, 2);
        assert_eq!(cb.metrics().total_successes, 0);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_success_resets_counter_while_closed() {
        let (cb, _) = breaker(3, Duration::from_secs(5));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset_and_metrics() {
        let (cb, _) = breaker(1, Duration::from_secs(5));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let metrics = cb.metrics();
        assert_eq!(metrics.total_failures, 1);
        assert!(metrics.last_failure.is_some());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_attempt());
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_exactly_once() {
        let cb = Arc::new(CircuitBreaker::new(
            "concurrent",
            CircuitBreakerConfig {
                failure_threshold: 50,
                recovery_timeout: Duration::from_secs(60),
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move { cb.record_failure() }));
        }
        for handle in handles {
            assert_ok!(handle.await);
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().total_failures, 100);
    }
}
