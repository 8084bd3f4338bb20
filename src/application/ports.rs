//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::policy::{Decision, DecisionReason};
use crate::domain::risk::RiskFlag;
use crate::domain::session::{Session, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

pub use crate::domain::policy::CounterResult;

/// Port for obtaining current time.
///
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Errors raised by storage adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the command
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer within the command timeout
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),
    /// The backend returned data that could not be decoded
    #[error("store returned corrupted data: {0}")]
    Corrupted(String),
}

/// Port for shared fixed-window counters.
///
/// The first increment of a key creates the window; later increments inside
/// it add one without moving its end. Increment and window creation happen
/// as one atomic step.
pub trait CounterStore: Send + Sync + Debug {
    /// Add one to `key`, opening a window of `window` if none is live.
    fn increment(&self, key: &str, window: Duration) -> Result<CounterResult, StoreError>;

    /// Drop the counter for `key`.
    fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Current count for `key`; zero once the window has ended.
    fn get_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove expired counters, returning how many were removed.
    ///
    /// Backends with native key expiry have nothing to do here.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// What a [`SessionStore::update`] closure wants done with the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWrite {
    /// Persist the modified session
    Save,
    /// Delete the session
    Remove,
    /// Leave the stored session as it was
    Keep,
    /// Delete the session and store this one under its own id, in one step
    Replace(Session),
}

/// Port for the session table.
///
/// Updates are atomic per session: the closure sees the current state and
/// its decision is applied before any concurrent update of the same session.
/// Adapters that retry on contention may run the closure more than once.
pub trait SessionStore: Send + Sync + Debug {
    /// Fetch a session.
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Store a new session that lives for `ttl`.
    fn insert(&self, session: Session, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a session, returning it if it existed.
    fn remove(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Atomically read-modify-write one session.
    ///
    /// Returns `Ok(None)` if the session does not exist. On
    /// [`SessionWrite::Save`] the session is kept for `ttl_of(&session)`, and
    /// on [`SessionWrite::Replace`] the replacement is kept for
    /// `ttl_of(&replacement)`. A replace either fully happens or leaves the
    /// stored session untouched.
    fn update<F, R>(
        &self,
        id: &SessionId,
        ttl_of: impl Fn(&Session) -> Duration,
        f: F,
    ) -> Result<Option<R>, StoreError>
    where
        F: FnMut(&mut Session) -> (SessionWrite, R);

    /// Remove every session for which `keep` returns false.
    ///
    /// Backends with native key expiry may return `Ok(0)` without scanning.
    fn retain<F>(&self, keep: F) -> Result<usize, StoreError>
    where
        F: FnMut(&Session) -> bool;

    /// Number of stored sessions.
    fn len(&self) -> usize;

    /// Check if no sessions are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Security-relevant events sent to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A request received a non-allow decision
    Decision {
        /// When
        timestamp: DateTime<Utc>,
        /// Endpoint policy name
        endpoint: String,
        /// Composite identifier
        identifier: String,
        /// Action taken
        decision: Decision,
        /// Why
        reason: DecisionReason,
        /// Risk score
        score: u8,
        /// Flags raised
        flags: Vec<RiskFlag>,
    },
    /// A session was created
    SessionCreated {
        /// When
        timestamp: DateTime<Utc>,
        /// Shortened session id
        session: String,
    },
    /// A session was bound to an identity
    SessionAuthenticated {
        /// When
        timestamp: DateTime<Utc>,
        /// Shortened session id
        session: String,
        /// Identity bound
        identity: String,
    },
    /// A session id was rotated
    SessionRotated {
        /// When
        timestamp: DateTime<Utc>,
        /// Shortened previous id
        from: String,
        /// Shortened new id
        to: String,
        /// Rotations so far
        rotation_count: u32,
    },
    /// A session was destroyed
    SessionDestroyed {
        /// When
        timestamp: DateTime<Utc>,
        /// Shortened session id
        session: String,
        /// Why it was destroyed
        cause: String,
    },
    /// An endpoint policy was changed through the admin surface
    PolicyUpdated {
        /// When
        timestamp: DateTime<Utc>,
        /// Endpoint policy name
        endpoint: String,
    },
    /// Counters for an identifier were cleared through the admin surface
    IdentifierCleared {
        /// When
        timestamp: DateTime<Utc>,
        /// Composite identifier
        identifier: String,
    },
}

impl AuditEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::Decision { .. } => "decision",
            AuditEvent::SessionCreated { .. } => "session_created",
            AuditEvent::SessionAuthenticated { .. } => "session_authenticated",
            AuditEvent::SessionRotated { .. } => "session_rotated",
            AuditEvent::SessionDestroyed { .. } => "session_destroyed",
            AuditEvent::PolicyUpdated { .. } => "policy_updated",
            AuditEvent::IdentifierCleared { .. } => "identifier_cleared",
        }
    }

    /// When the event happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::Decision { timestamp, .. }
            | AuditEvent::SessionCreated { timestamp, .. }
            | AuditEvent::SessionAuthenticated { timestamp, .. }
            | AuditEvent::SessionRotated { timestamp, .. }
            | AuditEvent::SessionDestroyed { timestamp, .. }
            | AuditEvent::PolicyUpdated { timestamp, .. }
            | AuditEvent::IdentifierCleared { timestamp, .. } => *timestamp,
        }
    }
}

/// Port for the audit trail.
///
/// Fire-and-forget: the engine never waits on or reacts to the sink.
pub trait AuditSink: Send + Sync + Debug {
    /// Record one event.
    fn log_event(&self, event: &AuditEvent);
}

/// Port for turning session ids into client-facing tokens and back.
///
/// Lets callers sign or encrypt tokens without the engine knowing how.
pub trait TokenWrapper: Send + Sync + Debug {
    /// Token handed to the client for `id`.
    fn wrap(&self, id: &SessionId) -> String;

    /// Recover the session id from a client token, `None` if it is not valid.
    fn unwrap(&self, token: &str) -> Option<SessionId>;
}
