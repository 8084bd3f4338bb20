//! Circuit breaker in front of the counter store.
//!
//! After consecutive store failures the circuit opens and calls are
//! short-circuited: the endpoint's fail mode applies without a round trip.
//! Once the recovery timeout has elapsed a single probe is let through
//! (half-open); its outcome closes or reopens the circuit.

use crate::application::ports::Clock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, operating normally
    Closed = 0,
    /// Circuit is open due to failures, store calls are skipped
    Open = 1,
    /// Circuit is testing if the store has recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors in circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerConfigError {
    /// Threshold is zero
    #[error("failure threshold must be greater than 0")]
    ZeroThreshold,
    /// Recovery timeout is zero
    #[error("recovery timeout must be greater than 0")]
    ZeroRecoveryTimeout,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before attempting recovery
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Check the range invariants.
    pub fn validate(&self) -> Result<(), CircuitBreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerConfigError::ZeroThreshold);
        }
        if self.recovery_timeout.is_zero() {
            return Err(CircuitBreakerConfigError::ZeroRecoveryTimeout);
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker guarding counter store calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    last_failure_millis: AtomicI64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a circuit breaker reading time from `clock`.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_millis: AtomicI64::new(0),
            config,
            clock,
        }
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Check if a store call should be attempted.
    ///
    /// Returns `false` while the circuit is open; callers then apply the
    /// endpoint's fail mode directly. Once the recovery timeout has elapsed
    /// exactly one caller gets `true` and must report its outcome through
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure). Everyone else keeps getting
    /// `false` until then.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let now = self.clock.now().timestamp_millis();
                let since = now.saturating_sub(self.last_failure_millis.load(Ordering::Acquire));
                let timeout = i64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(i64::MAX);

                if since >= timeout {
                    // Only one caller moves the circuit to half-open
                    let result = self.state.compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if result.is_ok() {
                        tracing::info!("Counter store circuit half-open, probing");
                    }
                    result.is_ok()
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful store call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.state.store(CircuitState::Closed as u8, Ordering::Release);
                tracing::info!("Counter store recovered, circuit closed");
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed store call.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_millis
            .store(self.clock.now().timestamp_millis(), Ordering::Release);

        match self.state() {
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                tracing::warn!("Counter store probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                if failures >= u64::from(self.config.failure_threshold) {
                    self.state.store(CircuitState::Open as u8, Ordering::Release);
                    tracing::error!(
                        consecutive_failures = failures,
                        "Counter store failing, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use chrono::{TimeZone, Utc};
    use std::thread;

    fn breaker(threshold: u32, recovery: Duration) -> (CircuitBreaker, MockClock) {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
            Arc::new(clock.clone()),
        );
        (cb, clock)
    }

    #[test]
    fn test_initial_state() {
        let (cb, _) = breaker(5, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_failure_threshold() {
        let (cb, _) = breaker(3, Duration::from_secs(1));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_recovery_probe_closes_circuit() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        cb.record_failure();
        cb.record_failure();

        clock.advance(Duration::from_secs(5));
        assert!(!cb.allow_request());

        clock.advance(Duration::from_secs(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // The trial call is still in flight
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_failed_probe_reopens_circuit() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        cb.record_failure();
        cb.record_failure();

        clock.advance(Duration::from_secs(10));
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Recovery timer restarts from the failed probe
        clock.advance(Duration::from_secs(9));
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (cb, _) = breaker(5, Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let (cb, _) = breaker(2, Duration::from_secs(10));
        cb.record_failure();
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_concurrent_failures() {
        let (cb, _) = breaker(5, Duration::from_secs(30));
        let cb = Arc::new(cb);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || cb.record_failure())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cb.consecutive_failures(), 10);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_one_caller() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        let cb = Arc::new(cb);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || cb.allow_request())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert_eq!(
            CircuitBreakerConfig {
                failure_threshold: 0,
                ..CircuitBreakerConfig::default()
            }
            .validate(),
            Err(CircuitBreakerConfigError::ZeroThreshold)
        );
    }
}
