//! Append-only record of non-allow outcomes.

use crate::domain::violation::{Limiter, Violation};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Default number of violations kept.
pub const DEFAULT_VIOLATION_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Ledger {
    recent: VecDeque<Violation>,
    counts: BTreeMap<Limiter, u64>,
    total: u64,
}

/// Bounded ring buffer of violations with lifetime totals.
///
/// When full, the oldest violation is evicted. Totals are never reduced by
/// eviction.
#[derive(Debug)]
pub struct ViolationRecorder {
    capacity: usize,
    ledger: Mutex<Ledger>,
}

impl ViolationRecorder {
    /// Create a recorder keeping at most `capacity` violations (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ledger: Mutex::new(Ledger {
                recent: VecDeque::with_capacity(capacity),
                ..Ledger::default()
            }),
        }
    }

    // A panic while holding the lock leaves the ledger consistent, so a
    // poisoned lock is simply recovered.
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a violation.
    pub fn record(&self, violation: Violation) {
        let mut ledger = self.lock();
        *ledger.counts.entry(violation.limiter).or_insert(0) += 1;
        ledger.total += 1;
        if ledger.recent.len() == self.capacity {
            ledger.recent.pop_front();
        }
        ledger.recent.push_back(violation);
    }

    /// Up to `limit` violations, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Violation> {
        self.lock().recent.iter().rev().take(limit).cloned().collect()
    }

    /// Lifetime totals per limiter.
    pub fn counts_by_limiter(&self) -> BTreeMap<Limiter, u64> {
        self.lock().counts.clone()
    }

    /// Number of violations currently held.
    pub fn len(&self) -> usize {
        self.lock().recent.len()
    }

    /// Check if no violations are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Violations recorded since creation, evicted ones included.
    pub fn total_recorded(&self) -> u64 {
        self.lock().total
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ViolationRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_VIOLATION_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::Decision;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::thread;

    fn violation(n: u32, limiter: Limiter) -> Violation {
        Violation {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, n % 60).unwrap(),
            identifier: format!("id-{}", n),
            limiter,
            endpoint: "code-delivery".to_string(),
            decision: Decision::Deny,
            score: 0,
            flags: Vec::new(),
        }
    }

    #[test]
    fn test_recent_is_newest_first() {
        let recorder = ViolationRecorder::new(10);
        for n in 0..3 {
            recorder.record(violation(n, Limiter::Counter));
        }
        let ids: Vec<String> = recorder.recent(10).into_iter().map(|v| v.identifier).collect();
        assert_eq!(ids, vec!["id-2", "id-1", "id-0"]);
        assert_eq!(recorder.recent(1).len(), 1);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest_but_keeps_totals() {
        let recorder = ViolationRecorder::new(3);
        for n in 0..5 {
            recorder.record(violation(n, Limiter::Counter));
        }
        recorder.record(violation(5, Limiter::Risk));

        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.total_recorded(), 6);
        assert_eq!(recorder.recent(10)[2].identifier, "id-3");

        let counts = recorder.counts_by_limiter();
        assert_eq!(counts.get(&Limiter::Counter), Some(&5));
        assert_eq!(counts.get(&Limiter::Risk), Some(&1));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let recorder = ViolationRecorder::new(0);
        assert_eq!(recorder.capacity(), 1);
        recorder.record(violation(0, Limiter::Store));
        recorder.record(violation(1, Limiter::Store));
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let recorder = Arc::new(ViolationRecorder::new(100));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || {
                    for n in 0..50 {
                        recorder.record(violation(t * 50 + n, Limiter::Counter));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(recorder.len(), 100);
        assert_eq!(recorder.total_recorded(), 400);
    }
}
