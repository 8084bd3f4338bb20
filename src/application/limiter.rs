//! Counter stage of the decision pipeline.
//!
//! The rate limiter increments the endpoint counter for a request and turns
//! the store's answer into a [`CounterVerdict`]. Store failures, timeouts and
//! panics never escape: they become [`CounterVerdict::Unavailable`] and the
//! endpoint's fail mode decides what happens next.

use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::metrics::Metrics;
use crate::application::ports::{CounterStore, StoreError};
use crate::domain::policy::{CounterVerdict, EndpointPolicy, FailMode};
use std::panic;
use std::sync::Arc;

/// Guards counter store calls with a circuit breaker.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    metrics: Metrics,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(
        store: Arc<dyn CounterStore>,
        metrics: Metrics,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            metrics,
            circuit_breaker,
        }
    }

    /// Count one request against `policy` under `counter_key`.
    ///
    /// # Fail-Safe Behavior
    /// If the store errors, panics, or the circuit is open, returns
    /// [`CounterVerdict::Unavailable`] and logs the degradation at a level
    /// matching the endpoint's fail mode.
    pub fn count(&self, policy: &EndpointPolicy, counter_key: &str) -> CounterVerdict {
        if !policy.enabled || policy.validate().is_err() {
            return CounterVerdict::Skipped;
        }

        if !self.circuit_breaker.allow_request() {
            self.degraded(policy, "circuit open");
            return CounterVerdict::Unavailable;
        }

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.store.increment(counter_key, policy.window())
        }));

        match result {
            Ok(Ok(counter)) => {
                self.circuit_breaker.record_success();
                tracing::trace!(
                    endpoint = %policy.name,
                    count = counter.count,
                    max = policy.max_requests,
                    "Counter incremented"
                );
                CounterVerdict::Counted(counter)
            }
            Ok(Err(error)) => {
                self.circuit_breaker.record_failure();
                self.degraded(policy, &error.to_string());
                CounterVerdict::Unavailable
            }
            Err(_) => {
                self.circuit_breaker.record_failure();
                self.degraded(policy, "counter store panicked");
                CounterVerdict::Unavailable
            }
        }
    }

    /// Drop a counter.
    pub fn reset(&self, counter_key: &str) -> Result<(), StoreError> {
        self.store.reset(counter_key)
    }

    /// Current count for a counter.
    pub fn get_count(&self, counter_key: &str) -> Result<u64, StoreError> {
        self.store.get_count(counter_key)
    }

    /// Remove expired counters from stores that keep them in memory.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// Get a reference to the circuit breaker.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    fn degraded(&self, policy: &EndpointPolicy, error: &str) {
        self.metrics.record_store_failure();
        match policy.fail_mode() {
            FailMode::Open => {
                self.metrics.record_fail_open();
                tracing::warn!(
                    endpoint = %policy.name,
                    error,
                    "Counter store unavailable, failing open on risk score"
                );
            }
            FailMode::Closed => {
                tracing::error!(
                    endpoint = %policy.name,
                    error,
                    "Counter store unavailable, failing closed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::circuit_breaker::CircuitBreakerConfig;
    use crate::application::ports::CounterResult;
    use crate::domain::policy::EndpointClass;
    use crate::infrastructure::mocks::{FailingCounterStore, MockClock};
    use crate::infrastructure::storage::MemoryCounterStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn clock() -> MockClock {
        MockClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    fn limiter(store: Arc<dyn CounterStore>, clock: &MockClock, threshold: u32) -> RateLimiter {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(30),
            },
            Arc::new(clock.clone()),
        );
        RateLimiter::new(store, Metrics::new(), Arc::new(breaker))
    }

    fn policy(class: EndpointClass) -> EndpointPolicy {
        EndpointPolicy::new("code-delivery", class, Duration::from_secs(3600), 3).unwrap()
    }

    #[test]
    fn test_counts_through_store() {
        let clock = clock();
        let limiter = limiter(Arc::new(MemoryCounterStore::new(Arc::new(clock.clone()))), &clock, 5);
        let p = policy(EndpointClass::CodeDelivery);

        for expected in 1..=4 {
            match limiter.count(&p, "k") {
                CounterVerdict::Counted(CounterResult { count, .. }) => assert_eq!(count, expected),
                other => panic!("unexpected verdict {:?}", other),
            }
        }
        assert_eq!(limiter.get_count("k").unwrap(), 4);
        limiter.reset("k").unwrap();
        assert_eq!(limiter.get_count("k").unwrap(), 0);
    }

    #[test]
    fn test_disabled_policy_skips_store() {
        let clock = clock();
        let store = FailingCounterStore::new(Arc::new(clock.clone()));
        let limiter = limiter(Arc::new(store.clone()), &clock, 5);
        let mut p = policy(EndpointClass::CodeDelivery);
        p.enabled = false;

        assert_eq!(limiter.count(&p, "k"), CounterVerdict::Skipped);
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_store_failure_is_unavailable() {
        let clock = clock();
        let store = FailingCounterStore::new(Arc::new(clock.clone()));
        let limiter = limiter(Arc::new(store.clone()), &clock, 5);

        assert_eq!(
            limiter.count(&policy(EndpointClass::Read), "k"),
            CounterVerdict::Unavailable
        );
        assert_eq!(limiter.metrics.snapshot().store_failures, 1);
        assert_eq!(limiter.metrics.snapshot().fail_open_passes, 1);

        assert_eq!(
            limiter.count(&policy(EndpointClass::CodeDelivery), "k"),
            CounterVerdict::Unavailable
        );
        assert_eq!(limiter.metrics.snapshot().fail_open_passes, 1);
    }

    #[test]
    fn test_open_circuit_short_circuits() {
        let clock = clock();
        let store = FailingCounterStore::new(Arc::new(clock.clone()));
        let limiter = limiter(Arc::new(store.clone()), &clock, 2);
        let p = policy(EndpointClass::CodeDelivery);

        limiter.count(&p, "k");
        limiter.count(&p, "k");
        assert_eq!(store.calls(), 2);

        // Circuit is open: no round trip
        assert_eq!(limiter.count(&p, "k"), CounterVerdict::Unavailable);
        assert_eq!(store.calls(), 2);

        // Recovery probe succeeds once the store is back
        store.set_failing(false);
        clock.advance(Duration::from_secs(30));
        assert!(matches!(limiter.count(&p, "k"), CounterVerdict::Counted(_)));
        assert_eq!(store.calls(), 3);
    }

    #[derive(Debug)]
    struct PanickingStore;

    impl CounterStore for PanickingStore {
        fn increment(&self, _key: &str, _window: Duration) -> Result<CounterResult, StoreError> {
            panic!("boom");
        }

        fn reset(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn get_count(&self, _key: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[test]
    fn test_panicking_store_is_contained() {
        let clock = clock();
        let limiter = limiter(Arc::new(PanickingStore), &clock, 5);
        assert_eq!(
            limiter.count(&policy(EndpointClass::CodeDelivery), "k"),
            CounterVerdict::Unavailable
        );
        assert_eq!(limiter.circuit_breaker().consecutive_failures(), 1);
    }

    #[test]
    fn test_concurrent_counting() {
        use std::thread;

        let clock = clock();
        let limiter = Arc::new(limiter(
            Arc::new(MemoryCounterStore::new(Arc::new(clock.clone()))),
            &clock,
            5,
        ));
        let p = policy(EndpointClass::Write);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let p = p.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        limiter.count(&p, "shared");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(limiter.get_count("shared").unwrap(), 200);
    }
}
