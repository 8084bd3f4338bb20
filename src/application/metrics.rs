//! Observability metrics for the engine.
//!
//! Counters are updated on every decision and session operation and can be
//! read at any time.

use crate::domain::policy::Decision;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking engine statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    assessments: AtomicU64,
    allowed: AtomicU64,
    challenged: AtomicU64,
    stepped_up: AtomicU64,
    denied: AtomicU64,
    store_failures: AtomicU64,
    fail_open_passes: AtomicU64,
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    rotations: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one assessment.
    pub(crate) fn record_decision(&self, decision: Decision) {
        self.inner.assessments.fetch_add(1, Ordering::Relaxed);
        let counter = match decision {
            Decision::Allow => &self.inner.allowed,
            Decision::Challenge => &self.inner.challenged,
            Decision::StepUp => &self.inner.stepped_up,
            Decision::Deny => &self.inner.denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a counter store failure or short-circuit.
    pub(crate) fn record_store_failure(&self) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request let through because its endpoint fails open.
    pub(crate) fn record_fail_open(&self) {
        self.inner.fail_open_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_created(&self) {
        self.inner.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_destroyed(&self) {
        self.inner.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sessions_destroyed(&self, count: u64) {
        self.inner
            .sessions_destroyed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.inner.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the total number of assessments.
    pub fn assessments(&self) -> u64 {
        self.inner.assessments.load(Ordering::Relaxed)
    }

    /// Get the total number of denials.
    pub fn denied(&self) -> u64 {
        self.inner.denied.load(Ordering::Relaxed)
    }

    /// Get the total number of counter store failures.
    pub fn store_failures(&self) -> u64 {
        self.inner.store_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            assessments: load(&self.inner.assessments),
            allowed: load(&self.inner.allowed),
            challenged: load(&self.inner.challenged),
            stepped_up: load(&self.inner.stepped_up),
            denied: load(&self.inner.denied),
            store_failures: load(&self.inner.store_failures),
            fail_open_passes: load(&self.inner.fail_open_passes),
            sessions_created: load(&self.inner.sessions_created),
            sessions_destroyed: load(&self.inner.sessions_destroyed),
            rotations: load(&self.inner.rotations),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        for counter in [
            &self.inner.assessments,
            &self.inner.allowed,
            &self.inner.challenged,
            &self.inner.stepped_up,
            &self.inner.denied,
            &self.inner.store_failures,
            &self.inner.fail_open_passes,
            &self.inner.sessions_created,
            &self.inner.sessions_destroyed,
            &self.inner.rotations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Requests assessed
    pub assessments: u64,
    /// Requests allowed
    pub allowed: u64,
    /// Requests challenged
    pub challenged: u64,
    /// Requests asked for step-up verification
    pub stepped_up: u64,
    /// Requests denied
    pub denied: u64,
    /// Counter store failures, including short-circuited calls
    pub store_failures: u64,
    /// Requests passed on risk alone because the store was down
    pub fail_open_passes: u64,
    /// Sessions created
    pub sessions_created: u64,
    /// Sessions destroyed, explicitly or by expiry
    pub sessions_destroyed: u64,
    /// Session rotations
    pub rotations: u64,
}

impl MetricsSnapshot {
    /// Share of assessments that were denied (0.0 to 1.0).
    ///
    /// Returns 0.0 if nothing has been assessed.
    pub fn denial_rate(&self) -> f64 {
        if self.assessments == 0 {
            0.0
        } else {
            self.denied as f64 / self.assessments as f64
        }
    }

    /// Assessments that did not end in a plain allow.
    pub fn escalations(&self) -> u64 {
        self.challenged
            .saturating_add(self.stepped_up)
            .saturating_add(self.denied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_state() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_decisions() {
        let metrics = Metrics::new();
        metrics.record_decision(Decision::Allow);
        metrics.record_decision(Decision::Allow);
        metrics.record_decision(Decision::Challenge);
        metrics.record_decision(Decision::StepUp);
        metrics.record_decision(Decision::Deny);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.assessments, 5);
        assert_eq!(snapshot.allowed, 2);
        assert_eq!(snapshot.challenged, 1);
        assert_eq!(snapshot.stepped_up, 1);
        assert_eq!(snapshot.denied, 1);
        assert_eq!(snapshot.escalations(), 3);
    }

    #[test]
    fn test_denial_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().denial_rate(), 0.0);

        metrics.record_decision(Decision::Allow);
        metrics.record_decision(Decision::Deny);
        assert!((metrics.snapshot().denial_rate() - 0.5).abs() < f64::EPSILON);

        metrics.record_decision(Decision::Deny);
        metrics.record_decision(Decision::Deny);
        assert!((metrics.snapshot().denial_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_session_counters() {
        let metrics = Metrics::new();
        metrics.record_session_created();
        metrics.record_rotation();
        metrics.record_session_destroyed();
        metrics.record_sessions_destroyed(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_created, 1);
        assert_eq!(snapshot.rotations, 1);
        assert_eq!(snapshot.sessions_destroyed, 3);
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        metrics.record_decision(Decision::Deny);
        metrics.record_store_failure();
        metrics.record_fail_open();

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_metrics_clone_shares_counters() {
        let metrics1 = Metrics::new();
        metrics1.record_decision(Decision::Allow);

        let metrics2 = metrics1.clone();
        metrics2.record_decision(Decision::Allow);

        assert_eq!(metrics1.assessments(), 2);
        assert_eq!(metrics2.assessments(), 2);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let metrics = Metrics::new();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_decision(Decision::Deny);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.denied(), 1000);
    }
}
