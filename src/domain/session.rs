//! Session state and lifecycle rules.
//!
//! A session is bound to the fingerprint it was created with. Its lifetime is
//! limited twice:
//! - Idle: `expires_at` moves forward on every successful validation
//! - Absolute: never beyond `created_at + absolute_timeout`, rotations included

use crate::domain::fingerprint::Fingerprint;
use crate::domain::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Opaque session identifier: 256 random bits, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        SessionId(raw.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix, full ids are bearer secrets
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{}…", prefix)
    }
}

/// Errors in session configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionConfigError {
    /// A timeout is zero
    #[error("session timeouts must be greater than 0")]
    ZeroTimeout,
    /// Idle timeout longer than the absolute timeout
    #[error("idle timeout must not exceed the absolute timeout")]
    IdleExceedsAbsolute,
}

/// Session lifetime limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity after which a session expires, in milliseconds
    pub idle_timeout_ms: u64,
    /// Lifetime after which a session expires regardless of activity, in milliseconds
    pub absolute_timeout_ms: u64,
    /// Rotations allowed before the session is destroyed
    pub max_rotations: u32,
}

impl SessionConfig {
    /// Create a validated config.
    pub fn new(
        idle_timeout: Duration,
        absolute_timeout: Duration,
        max_rotations: u32,
    ) -> Result<Self, SessionConfigError> {
        let config = Self {
            idle_timeout_ms: idle_timeout.as_millis().try_into().unwrap_or(u64::MAX),
            absolute_timeout_ms: absolute_timeout.as_millis().try_into().unwrap_or(u64::MAX),
            max_rotations,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the range invariants.
    pub fn validate(&self) -> Result<(), SessionConfigError> {
        if self.idle_timeout_ms == 0 || self.absolute_timeout_ms == 0 {
            return Err(SessionConfigError::ZeroTimeout);
        }
        if self.idle_timeout_ms > self.absolute_timeout_ms {
            return Err(SessionConfigError::IdleExceedsAbsolute);
        }
        Ok(())
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Absolute timeout.
    pub fn absolute_timeout(&self) -> Duration {
        Duration::from_millis(self.absolute_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30 * 60 * 1000,
            absolute_timeout_ms: 24 * 60 * 60 * 1000,
            max_rotations: 10,
        }
    }
}

/// Why a session failed liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Still usable
    Live,
    /// Older than the absolute timeout
    AbsoluteTimeout,
    /// Idle for too long
    Idle,
}

/// Server-side session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Current identifier
    pub id: SessionId,
    /// Device fingerprint the session is bound to; never changes
    pub fingerprint: Fingerprint,
    /// Origin of the last successful validation
    pub origin: IpAddr,
    /// Creation time, carried across rotations
    pub created_at: DateTime<Utc>,
    /// Last successful validation
    pub last_activity: DateTime<Utc>,
    /// Idle expiry
    pub expires_at: DateTime<Utc>,
    /// Rotations performed so far
    pub rotation_count: u32,
    /// Whether an identity has been verified
    pub authenticated: bool,
    /// Verified identity, once authenticated
    pub identity: Option<String>,
}

impl Session {
    /// A fresh, unauthenticated session.
    pub fn new(
        id: SessionId,
        fingerprint: Fingerprint,
        origin: IpAddr,
        now: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Self {
        let mut session = Self {
            id,
            fingerprint,
            origin,
            created_at: now,
            last_activity: now,
            expires_at: now,
            rotation_count: 0,
            authenticated: false,
            identity: None,
        };
        session.touch(now, config);
        session
    }

    /// Latest instant the session may live until.
    pub fn absolute_deadline(&self, config: &SessionConfig) -> DateTime<Utc> {
        time::after(self.created_at, config.absolute_timeout())
    }

    /// Check both timeouts; the absolute one takes precedence.
    pub fn liveness(&self, now: DateTime<Utc>, config: &SessionConfig) -> Liveness {
        if now > self.absolute_deadline(config) {
            Liveness::AbsoluteTimeout
        } else if now > self.expires_at {
            Liveness::Idle
        } else {
            Liveness::Live
        }
    }

    /// Record activity and slide the idle expiry, never past the absolute deadline.
    pub fn touch(&mut self, now: DateTime<Utc>, config: &SessionConfig) {
        self.last_activity = now;
        self.expires_at = time::after(now, config.idle_timeout()).min(self.absolute_deadline(config));
    }

    /// Successor state under a new id.
    ///
    /// Returns `None` when the rotation budget is spent.
    pub fn rotated(&self, id: SessionId, now: DateTime<Utc>, config: &SessionConfig) -> Option<Session> {
        if self.rotation_count >= config.max_rotations {
            return None;
        }
        let mut next = self.clone();
        next.id = id;
        next.rotation_count += 1;
        next.touch(now, config);
        Some(next)
    }

    /// Bind a verified identity.
    pub fn authenticate(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
        self.authenticated = true;
    }

    /// Time left before the session is purged, used as storage TTL.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        time::elapsed(now, self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::FingerprintSignals;
    use crate::domain::fingerprint::FingerprintGenerator;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn session(config: &SessionConfig) -> Session {
        let fp = FingerprintGenerator::new()
            .generate(&FingerprintSignals::new("ua"))
            .unwrap();
        Session::new(
            SessionId::new("a".repeat(64)),
            fp,
            "81.2.69.160".parse().unwrap(),
            start(),
            config,
        )
    }

    fn config(idle_secs: u64, absolute_secs: u64, max_rotations: u32) -> SessionConfig {
        SessionConfig::new(
            Duration::from_secs(idle_secs),
            Duration::from_secs(absolute_secs),
            max_rotations,
        )
        .unwrap()
    }

    #[test]
    fn test_idle_expiry_slides() {
        let config = config(60, 3600, 5);
        let mut s = session(&config);
        assert_eq!(s.expires_at, time::after(start(), Duration::from_secs(60)));

        let later = time::after(start(), Duration::from_secs(50));
        assert_eq!(s.liveness(later, &config), Liveness::Live);
        s.touch(later, &config);

        let much_later = time::after(start(), Duration::from_secs(100));
        assert_eq!(s.liveness(much_later, &config), Liveness::Live);
        assert_eq!(
            s.liveness(time::after(start(), Duration::from_secs(111)), &config),
            Liveness::Idle
        );
    }

    #[test]
    fn test_absolute_deadline_caps_expiry() {
        let config = config(60, 90, 5);
        let mut s = session(&config);
        s.touch(time::after(start(), Duration::from_secs(50)), &config);
        assert_eq!(s.expires_at, s.absolute_deadline(&config));

        let past = time::after(start(), Duration::from_secs(91));
        assert_eq!(s.liveness(past, &config), Liveness::AbsoluteTimeout);
    }

    #[test]
    fn test_rotation_keeps_identity_and_created_at() {
        let config = config(60, 3600, 1);
        let mut s = session(&config);
        s.authenticate("+33612480931");

        let now = time::after(start(), Duration::from_secs(10));
        let next = s.rotated(SessionId::new("b".repeat(64)), now, &config).unwrap();
        assert_eq!(next.rotation_count, 1);
        assert_eq!(next.created_at, s.created_at);
        assert_eq!(next.identity.as_deref(), Some("+33612480931"));
        assert!(next.authenticated);
        assert_ne!(next.id, s.id);

        assert!(next.rotated(SessionId::new("c".repeat(64)), now, &config).is_none());
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            SessionConfig::new(Duration::ZERO, Duration::from_secs(1), 1),
            Err(SessionConfigError::ZeroTimeout)
        );
        assert_eq!(
            SessionConfig::new(Duration::from_secs(2), Duration::from_secs(1), 1),
            Err(SessionConfigError::IdleExceedsAbsolute)
        );
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_display_hides_full_id() {
        let id = SessionId::new("0123456789abcdef");
        assert_eq!(id.to_string(), "01234567…");
    }
}
