//! In-process storage adapters.
//!
//! Both adapters are backed by DashMap: reads are lock-free and writes lock a
//! single shard, so every per-key operation is atomic without a global lock.

use crate::application::ports::{
    Clock, CounterResult, CounterStore, SessionStore, SessionWrite, StoreError,
};
use crate::domain::session::{Session, SessionId};
use crate::domain::time;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    window_end: DateTime<Utc>,
}

/// Fixed-window counters held in memory.
///
/// Suitable for a single process. Expired entries linger until
/// [`CounterStore::purge_expired`] runs; they are ignored meanwhile.
#[derive(Debug)]
pub struct MemoryCounterStore {
    map: DashMap<String, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            map: DashMap::new(),
            clock,
        }
    }

    /// Get the number of stored counters, expired ones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if no counters are stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment(&self, key: &str, window: Duration) -> Result<CounterResult, StoreError> {
        let now = self.clock.now();
        // The entry guard holds the shard lock, so the window check and the
        // increment are a single step for concurrent callers.
        let mut entry = self.map.entry(key.to_string()).or_insert(WindowCounter {
            count: 0,
            window_end: now,
        });

        if now >= entry.window_end {
            entry.count = 0;
            entry.window_end = time::after(now, window);
        }
        entry.count = entry.count.saturating_add(1);

        Ok(CounterResult {
            count: entry.count,
            ttl_remaining: time::elapsed(now, entry.window_end),
        })
    }

    fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }

    fn get_count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(self
            .map
            .get(key)
            .filter(|entry| now < entry.window_end)
            .map_or(0, |entry| entry.count))
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.map.len();
        self.map.retain(|_, entry| now < entry.window_end);
        before.saturating_sub(self.map.len())
    }
}

/// Session table held in memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    map: DashMap<SessionId, Session>,
}

impl MemorySessionStore {
    /// Create an empty session table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.map.get(id).map(|entry| entry.value().clone()))
    }

    fn insert(&self, session: Session, _ttl: Duration) -> Result<(), StoreError> {
        self.map.insert(session.id.clone(), session);
        Ok(())
    }

    fn remove(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.map.remove(id).map(|(_, session)| session))
    }

    fn update<F, R>(
        &self,
        id: &SessionId,
        _ttl_of: impl Fn(&Session) -> Duration,
        mut f: F,
    ) -> Result<Option<R>, StoreError>
    where
        F: FnMut(&mut Session) -> (SessionWrite, R),
    {
        match self.map.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let mut working = occupied.get().clone();
                let (write, result) = f(&mut working);
                match write {
                    SessionWrite::Save => {
                        occupied.insert(working);
                    }
                    SessionWrite::Remove => {
                        occupied.remove();
                    }
                    SessionWrite::Keep => {}
                    SessionWrite::Replace(next) => {
                        // Release the shard lock before touching another key
                        occupied.remove();
                        self.map.insert(next.id.clone(), next);
                    }
                }
                Ok(Some(result))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    fn retain<F>(&self, mut keep: F) -> Result<usize, StoreError>
    where
        F: FnMut(&Session) -> bool,
    {
        let before = self.map.len();
        self.map.retain(|_, session| keep(session));
        Ok(before.saturating_sub(self.map.len()))
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
