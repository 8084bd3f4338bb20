//! Stores that can be switched into failure.

use crate::application::ports::{
    Clock, CounterResult, CounterStore, SessionStore, SessionWrite, StoreError,
};
use crate::domain::session::{Session, SessionId};
use crate::infrastructure::storage::{MemoryCounterStore, MemorySessionStore};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory counter store with a failure switch.
///
/// Starts out failing. While failing, every call returns
/// [`StoreError::Unavailable`]; otherwise calls go to an inner
/// [`MemoryCounterStore`]. Clones share the switch and the counters.
#[derive(Debug, Clone)]
pub struct FailingCounterStore {
    inner: Arc<MemoryCounterStore>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl FailingCounterStore {
    /// Create a failing store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MemoryCounterStore::new(clock)),
            failing: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Turn failures on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls that reached the store.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CounterStore for FailingCounterStore {
    fn increment(&self, key: &str, window: Duration) -> Result<CounterResult, StoreError> {
        self.check()?;
        self.inner.increment(key, window)
    }

    fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.reset(key)
    }

    fn get_count(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.get_count(key)
    }
}

/// In-memory session store whose writes can be made to fail.
///
/// Inserts and updates have separate switches, both off at start. A failing
/// update returns [`StoreError::Unavailable`] without applying anything,
/// unless the closure asked for [`SessionWrite::Keep`]. Reads always work.
#[derive(Debug, Default)]
pub struct FailingSessionStore {
    inner: MemorySessionStore,
    failing_inserts: AtomicBool,
    failing_updates: AtomicBool,
}

impl FailingSessionStore {
    /// Create a store with both switches off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`SessionStore::insert`] fail.
    pub fn set_failing_inserts(&self, failing: bool) {
        self.failing_inserts.store(failing, Ordering::SeqCst);
    }

    /// Make writing [`SessionStore::update`] and [`SessionStore::remove`] calls fail.
    pub fn set_failing_updates(&self, failing: bool) {
        self.failing_updates.store(failing, Ordering::SeqCst);
    }
}

fn write_refused() -> StoreError {
    StoreError::Unavailable("write refused".to_string())
}

impl SessionStore for FailingSessionStore {
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.inner.get(id)
    }

    fn insert(&self, session: Session, ttl: Duration) -> Result<(), StoreError> {
        if self.failing_inserts.load(Ordering::SeqCst) {
            return Err(write_refused());
        }
        self.inner.insert(session, ttl)
    }

    fn remove(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        if self.failing_updates.load(Ordering::SeqCst) {
            return Err(write_refused());
        }
        self.inner.remove(id)
    }

    fn update<F, R>(
        &self,
        id: &SessionId,
        ttl_of: impl Fn(&Session) -> Duration,
        mut f: F,
    ) -> Result<Option<R>, StoreError>
    where
        F: FnMut(&mut Session) -> (SessionWrite, R),
    {
        if !self.failing_updates.load(Ordering::SeqCst) {
            return self.inner.update(id, ttl_of, f);
        }
        let Some(mut session) = self.inner.get(id)? else {
            return Ok(None);
        };
        match f(&mut session) {
            (SessionWrite::Keep, result) => Ok(Some(result)),
            _ => Err(write_refused()),
        }
    }

    fn retain<F>(&self, keep: F) -> Result<usize, StoreError>
    where
        F: FnMut(&Session) -> bool,
    {
        self.inner.retain(keep)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
