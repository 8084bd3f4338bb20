//! Session lifecycle management.
//!
//! The manager owns the rules for creating, validating, rotating and
//! destroying sessions; the table itself sits behind the [`SessionStore`]
//! port. Every state change of one session is a single atomic store update.

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, SessionStore, SessionWrite, StoreError};
use crate::domain::fingerprint::Fingerprint;
use crate::domain::session::{Liveness, Session, SessionConfig, SessionId};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::IpAddr;
use std::sync::Arc;

/// Bytes of randomness in a session id.
const SESSION_ID_BYTES: usize = 32;

/// Errors from session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session under this id
    #[error("session not found")]
    NotFound,
    /// Idle timeout elapsed; the session was destroyed
    #[error("session expired")]
    Expired,
    /// Presented from a different device; the session was destroyed
    #[error("session fingerprint mismatch")]
    FingerprintMismatch,
    /// Absolute lifetime elapsed; the session was destroyed
    #[error("session absolute timeout exceeded")]
    AbsoluteTimeoutExceeded,
    /// Rotation budget spent; the session was destroyed
    #[error("session rotation limit exceeded")]
    RotationLimitExceeded,
    /// The session table could not be reached
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether the failed operation removed the session.
    pub fn destroyed_session(&self) -> bool {
        matches!(
            self,
            SessionError::Expired
                | SessionError::FingerprintMismatch
                | SessionError::AbsoluteTimeoutExceeded
                | SessionError::RotationLimitExceeded
        )
    }
}

/// A session that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSession {
    /// State after the activity was recorded
    pub session: Session,
    /// The origin changed; the caller should rotate the id
    pub require_rotation: bool,
}

/// Creates, validates, rotates and destroys sessions.
#[derive(Debug)]
pub struct SessionManager<S: SessionStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    metrics: Metrics,
}

impl<S: SessionStore> SessionManager<S> {
    /// Create a manager over `store`.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: SessionConfig, metrics: Metrics) -> Self {
        Self {
            store,
            clock,
            config,
            metrics,
        }
    }

    /// Session lifetime limits.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start an unauthenticated session bound to `fingerprint`.
    pub fn create(&self, origin: IpAddr, fingerprint: Fingerprint) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let session = Session::new(generate_id(), fingerprint, origin, now, &self.config);
        self.store.insert(session.clone(), session.remaining(now))?;

        self.metrics.record_session_created();
        tracing::debug!(session = %session.id, "Session created");
        Ok(session)
    }

    /// Check a session presented by a client and record the activity.
    ///
    /// Checks run in order: existence, absolute timeout, idle timeout,
    /// fingerprint. Any failure but the first destroys the session. An origin
    /// change alone keeps the session valid and asks for a rotation.
    pub fn validate(
        &self,
        id: &SessionId,
        fingerprint: &Fingerprint,
        origin: IpAddr,
    ) -> Result<ValidatedSession, SessionError> {
        let now = self.clock.now();
        let config = self.config;

        let outcome = self.store.update(
            id,
            |s| s.remaining(now),
            |session| {
                if let Err(error) = check_liveness(session, now, &config) {
                    return (SessionWrite::Remove, Err(error));
                }
                if session.fingerprint != *fingerprint {
                    return (SessionWrite::Remove, Err(SessionError::FingerprintMismatch));
                }

                let require_rotation = session.origin != origin;
                session.origin = origin;
                session.touch(now, &config);
                (
                    SessionWrite::Save,
                    Ok(ValidatedSession {
                        session: session.clone(),
                        require_rotation,
                    }),
                )
            },
        )?;

        let result = outcome.unwrap_or(Err(SessionError::NotFound));
        match &result {
            Ok(validated) if validated.require_rotation => {
                tracing::info!(session = %id, origin = %origin, "Session origin changed, rotation required");
            }
            Err(SessionError::FingerprintMismatch) => {
                self.metrics.record_session_destroyed();
                tracing::warn!(session = %id, origin = %origin, "Session presented from another device, destroyed");
            }
            Err(error) if error.destroyed_session() => {
                self.metrics.record_session_destroyed();
                tracing::debug!(session = %id, error = %error, "Session timed out, destroyed");
            }
            _ => {}
        }
        result
    }

    /// Replace the session id, carrying identity, authentication and creation time.
    ///
    /// The old id stops working immediately. The swap is a single store
    /// operation: on a store error both ids keep their previous state. Past
    /// the rotation budget the session is destroyed instead.
    pub fn rotate(&self, id: &SessionId) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let config = self.config;
        let next_id = generate_id();

        let outcome = self.store.update(
            id,
            |s| s.remaining(now),
            |session| {
                if let Err(error) = check_liveness(session, now, &config) {
                    return (SessionWrite::Remove, Err(error));
                }
                match session.rotated(next_id.clone(), now, &config) {
                    Some(next) => (SessionWrite::Replace(next.clone()), Ok(next)),
                    None => (SessionWrite::Remove, Err(SessionError::RotationLimitExceeded)),
                }
            },
        )?;

        match outcome.unwrap_or(Err(SessionError::NotFound)) {
            Ok(next) => {
                self.metrics.record_rotation();
                tracing::debug!(
                    from = %id,
                    to = %next.id,
                    rotation_count = next.rotation_count,
                    "Session rotated"
                );
                Ok(next)
            }
            Err(error) => {
                if error.destroyed_session() {
                    self.metrics.record_session_destroyed();
                    tracing::info!(session = %id, error = %error, "Session destroyed on rotation");
                }
                Err(error)
            }
        }
    }

    /// Bind a verified identity to a live session.
    pub fn authenticate(&self, id: &SessionId, identity: &str) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let config = self.config;

        let outcome = self.store.update(
            id,
            |s| s.remaining(now),
            |session| {
                if let Err(error) = check_liveness(session, now, &config) {
                    return (SessionWrite::Remove, Err(error));
                }
                session.authenticate(identity);
                session.touch(now, &config);
                (SessionWrite::Save, Ok(session.clone()))
            },
        )?;

        let result = outcome.unwrap_or(Err(SessionError::NotFound));
        if matches!(&result, Err(error) if error.destroyed_session()) {
            self.metrics.record_session_destroyed();
        }
        result
    }

    /// Remove a session. Returns whether it existed.
    pub fn destroy(&self, id: &SessionId) -> Result<bool, SessionError> {
        let existed = self.store.remove(id)?.is_some();
        if existed {
            self.metrics.record_session_destroyed();
            tracing::debug!(session = %id, "Session destroyed");
        }
        Ok(existed)
    }

    /// Read a session without recording activity.
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>, SessionError> {
        Ok(self.store.get(id)?)
    }

    /// Remove sessions past either timeout.
    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let config = self.config;
        let removed = self
            .store
            .retain(|session| session.liveness(now, &config) == Liveness::Live)?;
        self.metrics.record_sessions_destroyed(removed as u64);
        Ok(removed)
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

fn check_liveness(
    session: &Session,
    now: DateTime<Utc>,
    config: &SessionConfig,
) -> Result<(), SessionError> {
    match session.liveness(now, config) {
        Liveness::Live => Ok(()),
        Liveness::AbsoluteTimeout => Err(SessionError::AbsoluteTimeoutExceeded),
        Liveness::Idle => Err(SessionError::Expired),
    }
}

fn generate_id() -> SessionId {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    SessionId::new(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::FingerprintSignals;
    use crate::domain::fingerprint::FingerprintGenerator;
    use crate::infrastructure::mocks::MockClock;
    use crate::infrastructure::storage::MemorySessionStore;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::time::Duration;

    struct Fixture {
        manager: SessionManager<MemorySessionStore>,
        clock: MockClock,
        metrics: Metrics,
    }

    fn fixture(idle_secs: u64, absolute_secs: u64, max_rotations: u32) -> Fixture {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let metrics = Metrics::new();
        let config = SessionConfig::new(
            Duration::from_secs(idle_secs),
            Duration::from_secs(absolute_secs),
            max_rotations,
        )
        .unwrap();
        let manager = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(clock.clone()),
            config,
            metrics.clone(),
        );
        Fixture {
            manager,
            clock,
            metrics,
        }
    }

    fn fp(ua: &str) -> Fingerprint {
        FingerprintGenerator::new()
            .generate(&FingerprintSignals::new(ua))
            .unwrap()
    }

    fn home() -> IpAddr {
        "81.2.69.160".parse().unwrap()
    }

    #[test]
    fn test_create_generates_unique_hex_ids() {
        let f = fixture(60, 3600, 5);
        let ids: HashSet<String> = (0..50)
            .map(|_| f.manager.create(home(), fp("ua")).unwrap().id.as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 50);
        for id in &ids {
            assert_eq!(id.len(), 64);
            assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        }
        assert_eq!(f.metrics.snapshot().sessions_created, 50);
    }

    #[test]
    fn test_validate_happy_path_slides_expiry() {
        let f = fixture(60, 3600, 5);
        let session = f.manager.create(home(), fp("ua")).unwrap();

        f.clock.advance(Duration::from_secs(50));
        let validated = f.manager.validate(&session.id, &fp("ua"), home()).unwrap();
        assert!(!validated.require_rotation);
        assert!(validated.session.expires_at > session.expires_at);

        f.clock.advance(Duration::from_secs(50));
        assert!(f.manager.validate(&session.id, &fp("ua"), home()).is_ok());
    }

    #[test]
    fn test_fingerprint_mismatch_destroys() {
        let f = fixture(60, 3600, 5);
        let session = f.manager.create(home(), fp("ua")).unwrap();

        assert_eq!(
            f.manager.validate(&session.id, &fp("attacker"), home()),
            Err(SessionError::FingerprintMismatch)
        );
        assert_eq!(
            f.manager.validate(&session.id, &fp("ua"), home()),
            Err(SessionError::NotFound)
        );
        assert_eq!(f.metrics.snapshot().sessions_destroyed, 1);
    }

    #[test]
    fn test_origin_change_requires_rotation_once() {
        let f = fixture(60, 3600, 5);
        let session = f.manager.create(home(), fp("ua")).unwrap();
        let cafe: IpAddr = "81.2.69.200".parse().unwrap();

        assert!(f.manager.validate(&session.id, &fp("ua"), cafe).unwrap().require_rotation);
        assert!(!f.manager.validate(&session.id, &fp("ua"), cafe).unwrap().require_rotation);
    }

    #[test]
    fn test_idle_timeout() {
        let f = fixture(60, 3600, 5);
        let session = f.manager.create(home(), fp("ua")).unwrap();

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(
            f.manager.validate(&session.id, &fp("ua"), home()),
            Err(SessionError::Expired)
        );
        assert!(f.manager.is_empty());
    }

    #[test]
    fn test_absolute_timeout_despite_activity() {
        let f = fixture(60, 150, 5);
        let session = f.manager.create(home(), fp("ua")).unwrap();

        for _ in 0..3 {
            f.clock.advance(Duration::from_secs(50));
            f.manager.validate(&session.id, &fp("ua"), home()).unwrap();
        }

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(
            f.manager.validate(&session.id, &fp("ua"), home()),
            Err(SessionError::AbsoluteTimeoutExceeded)
        );
    }

    #[test]
    fn test_rotation() {
        let f = fixture(60, 3600, 2);
        let session = f.manager.create(home(), fp("ua")).unwrap();
        f.manager.authenticate(&session.id, "+33612480931").unwrap();

        let rotated = f.manager.rotate(&session.id).unwrap();
        assert_ne!(rotated.id, session.id);
        assert_eq!(rotated.rotation_count, 1);
        assert_eq!(rotated.identity.as_deref(), Some("+33612480931"));
        assert!(rotated.authenticated);
        assert_eq!(rotated.created_at, session.created_at);

        assert_eq!(
            f.manager.validate(&session.id, &fp("ua"), home()),
            Err(SessionError::NotFound)
        );
        assert!(f.manager.validate(&rotated.id, &fp("ua"), home()).is_ok());

        let again = f.manager.rotate(&rotated.id).unwrap();
        assert_eq!(again.rotation_count, 2);

        assert_eq!(
            f.manager.rotate(&again.id),
            Err(SessionError::RotationLimitExceeded)
        );
        assert!(f.manager.get(&again.id).unwrap().is_none());
        assert_eq!(f.metrics.snapshot().rotations, 2);
    }

    #[test]
    fn test_destroy_and_purge() {
        let f = fixture(60, 3600, 5);
        let a = f.manager.create(home(), fp("ua")).unwrap();
        let _b = f.manager.create(home(), fp("ua")).unwrap();

        assert!(f.manager.destroy(&a.id).unwrap());
        assert!(!f.manager.destroy(&a.id).unwrap());

        f.clock.advance(Duration::from_secs(61));
        let c = f.manager.create(home(), fp("ua")).unwrap();
        assert_eq!(f.manager.purge_expired().unwrap(), 1);
        assert_eq!(f.manager.len(), 1);
        assert!(f.manager.get(&c.id).unwrap().is_some());
    }

    #[test]
    fn test_unknown_session() {
        let f = fixture(60, 3600, 5);
        let missing = SessionId::new("f".repeat(64));
        assert_eq!(
            f.manager.validate(&missing, &fp("ua"), home()),
            Err(SessionError::NotFound)
        );
        assert_eq!(f.manager.rotate(&missing), Err(SessionError::NotFound));
        assert_eq!(
            f.manager.authenticate(&missing, "+33612480931"),
            Err(SessionError::NotFound)
        );
    }
}
