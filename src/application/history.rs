//! In-process behavior history.
//!
//! Keeps recent attempts per identity and per source (origin + fingerprint),
//! plus verification failures per identity. Entries older than the retention
//! horizon are dropped on access and by the maintenance worker.

use crate::domain::context::RequestContext;
use crate::domain::fingerprint::Fingerprint;
use crate::domain::time;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Most attempts kept per identity or source.
pub const MAX_ENTRIES_PER_KEY: usize = 256;

/// One observed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// When it happened
    pub at: DateTime<Utc>,
    /// Identity reference used
    pub identity: String,
    /// Origin address
    pub origin: IpAddr,
    /// Device fingerprint
    pub fingerprint: Fingerprint,
}

/// Recent history relevant to one request, the request itself included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BehaviorHistory {
    /// Attempts for the request's identity, oldest first
    pub identity_attempts: Vec<AttemptRecord>,
    /// Attempts from the request's origin and fingerprint, oldest first
    pub source_attempts: Vec<AttemptRecord>,
    /// Failed verifications for the identity, oldest first
    pub failures: Vec<DateTime<Utc>>,
}

impl BehaviorHistory {
    /// Attempts for the identity no older than `window` at `now`.
    pub fn identity_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> impl Iterator<Item = &AttemptRecord> {
        within(&self.identity_attempts, now, window)
    }

    /// Attempts from the source no older than `window` at `now`.
    pub fn source_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> impl Iterator<Item = &AttemptRecord> {
        within(&self.source_attempts, now, window)
    }

    /// Failures no older than `window` at `now`.
    pub fn failures_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = time::before(now, window);
        self.failures.iter().filter(|at| **at >= cutoff).count()
    }
}

fn within(
    records: &[AttemptRecord],
    now: DateTime<Utc>,
    window: Duration,
) -> impl Iterator<Item = &AttemptRecord> {
    let cutoff = time::before(now, window);
    records.iter().filter(move |record| record.at >= cutoff)
}

#[derive(Debug, Default)]
struct IdentityLog {
    attempts: VecDeque<AttemptRecord>,
    failures: VecDeque<DateTime<Utc>>,
}

/// Tracks attempts and verification outcomes.
///
/// Clones share the same history.
#[derive(Debug, Clone)]
pub struct BehaviorTracker {
    by_identity: Arc<DashMap<String, IdentityLog>>,
    by_source: Arc<DashMap<String, VecDeque<AttemptRecord>>>,
    retention: Duration,
}

impl BehaviorTracker {
    /// Create a tracker that forgets entries older than `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            by_identity: Arc::new(DashMap::new()),
            by_source: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Record the attempt described by `ctx` and return the history around it.
    pub fn observe(&self, ctx: &RequestContext, fingerprint: &Fingerprint) -> BehaviorHistory {
        let now = ctx.timestamp;
        let record = AttemptRecord {
            at: now,
            identity: ctx.identity.clone(),
            origin: ctx.origin,
            fingerprint: fingerprint.clone(),
        };

        let (identity_attempts, failures) = {
            let mut log = self.by_identity.entry(ctx.identity.clone()).or_default();
            push_bounded(&mut log.attempts, record.clone());
            expire_old_records(&mut log.attempts, now, self.retention);
            expire_old_timestamps(&mut log.failures, now, self.retention);
            (
                log.attempts.iter().cloned().collect(),
                log.failures.iter().copied().collect(),
            )
        };

        let source_attempts = {
            let mut log = self
                .by_source
                .entry(source_key(ctx.origin, fingerprint))
                .or_default();
            push_bounded(&mut log, record);
            expire_old_records(&mut log, now, self.retention);
            log.iter().cloned().collect()
        };

        BehaviorHistory {
            identity_attempts,
            source_attempts,
            failures,
        }
    }

    /// Record a verification outcome for `identity`.
    ///
    /// Only failures are kept; a success clears earlier failures.
    pub fn record_outcome(&self, identity: &str, success: bool, at: DateTime<Utc>) {
        let mut log = self.by_identity.entry(identity.to_string()).or_default();
        if success {
            log.failures.clear();
        } else {
            log.failures.push_back(at);
            while log.failures.len() > MAX_ENTRIES_PER_KEY {
                log.failures.pop_front();
            }
        }
        expire_old_timestamps(&mut log.failures, at, self.retention);
    }

    /// Drop everything older than the retention horizon.
    ///
    /// Returns the number of keys removed.
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.by_identity.len() + self.by_source.len();

        self.by_identity.retain(|_, log| {
            expire_old_records(&mut log.attempts, now, self.retention);
            expire_old_timestamps(&mut log.failures, now, self.retention);
            !(log.attempts.is_empty() && log.failures.is_empty())
        });
        self.by_source.retain(|_, log| {
            expire_old_records(log, now, self.retention);
            !log.is_empty()
        });

        before.saturating_sub(self.by_identity.len() + self.by_source.len())
    }

    /// Number of tracked identities and sources.
    pub fn len(&self) -> usize {
        self.by_identity.len() + self.by_source.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn source_key(origin: IpAddr, fingerprint: &Fingerprint) -> String {
    format!("{}|{}", origin, fingerprint.short())
}

fn push_bounded(log: &mut VecDeque<AttemptRecord>, record: AttemptRecord) {
    log.push_back(record);
    while log.len() > MAX_ENTRIES_PER_KEY {
        log.pop_front();
    }
}

fn expire_old_records(log: &mut VecDeque<AttemptRecord>, now: DateTime<Utc>, retention: Duration) {
    let cutoff = time::before(now, retention);
    while let Some(oldest) = log.front() {
        if oldest.at < cutoff {
            log.pop_front();
        } else {
            break;
        }
    }
}

fn expire_old_timestamps(log: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, retention: Duration) {
    let cutoff = time::before(now, retention);
    while let Some(&oldest) = log.front() {
        if oldest < cutoff {
            log.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::FingerprintSignals;
    use crate::domain::fingerprint::FingerprintGenerator;
    use chrono::TimeZone;

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn fp(ua: &str) -> Fingerprint {
        FingerprintGenerator::new()
            .generate(&FingerprintSignals::new(ua))
            .unwrap()
    }

    fn ctx(identity: &str, origin: &str, at: DateTime<Utc>) -> RequestContext {
        RequestContext::new(
            "code-delivery",
            identity,
            origin.parse().unwrap(),
            FingerprintSignals::new("ua"),
            at,
        )
    }

    #[test]
    fn test_observe_includes_current_attempt() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        let history = tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &fp("ua"));
        assert_eq!(history.identity_attempts.len(), 1);
        assert_eq!(history.source_attempts.len(), 1);
        assert!(history.failures.is_empty());
    }

    #[test]
    fn test_source_history_spans_identities() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        let device = fp("ua");
        for i in 0..4 {
            tracker.observe(&ctx(&format!("+3361248093{}", i), "81.2.69.160", start()), &device);
        }
        let history = tracker.observe(&ctx("+33612480939", "81.2.69.160", start()), &device);
        assert_eq!(history.source_attempts.len(), 5);
        assert_eq!(history.identity_attempts.len(), 1);

        let other_device = tracker.observe(&ctx("+33612480939", "81.2.69.160", start()), &fp("other"));
        assert_eq!(other_device.source_attempts.len(), 1);
        assert_eq!(other_device.identity_attempts.len(), 2);
    }

    #[test]
    fn test_old_attempts_expire() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        let device = fp("ua");
        tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &device);

        let later = time::after(start(), Duration::from_secs(601));
        let history = tracker.observe(&ctx("+33612480931", "81.2.69.160", later), &device);
        assert_eq!(history.identity_attempts.len(), 1);
        assert_eq!(history.identity_attempts[0].at, later);
    }

    #[test]
    fn test_window_filters() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        let device = fp("ua");
        tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &device);
        let now = time::after(start(), Duration::from_secs(400));
        let history = tracker.observe(&ctx("+33612480931", "81.2.69.161", now), &device);

        assert_eq!(history.identity_within(now, TEN_MINUTES).count(), 2);
        assert_eq!(history.identity_within(now, Duration::from_secs(300)).count(), 1);
    }

    #[test]
    fn test_failures_and_success_reset() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        for _ in 0..3 {
            tracker.record_outcome("+33612480931", false, start());
        }
        let history = tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &fp("ua"));
        assert_eq!(history.failures_within(start(), TEN_MINUTES), 3);

        tracker.record_outcome("+33612480931", true, start());
        let history = tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &fp("ua"));
        assert!(history.failures.is_empty());
    }

    #[test]
    fn test_bounded_per_key() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        let device = fp("ua");
        let mut last = BehaviorHistory::default();
        for _ in 0..(MAX_ENTRIES_PER_KEY + 10) {
            last = tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &device);
        }
        assert_eq!(last.identity_attempts.len(), MAX_ENTRIES_PER_KEY);
        assert_eq!(last.source_attempts.len(), MAX_ENTRIES_PER_KEY);
    }

    #[test]
    fn test_purge_removes_stale_keys() {
        let tracker = BehaviorTracker::new(TEN_MINUTES);
        tracker.observe(&ctx("+33612480931", "81.2.69.160", start()), &fp("ua"));
        tracker.record_outcome("+33699999998", false, start());
        assert_eq!(tracker.len(), 3);

        assert_eq!(tracker.purge(time::after(start(), Duration::from_secs(60))), 0);
        assert_eq!(tracker.purge(time::after(start(), Duration::from_secs(601))), 3);
        assert!(tracker.is_empty());
    }
}
