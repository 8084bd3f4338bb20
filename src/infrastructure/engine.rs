//! The abuse-prevention engine.
//!
//! [`AbuseEngine`] ties the pipeline together: fingerprint, counter, risk
//! score, decision, violation log and audit trail for every request, plus
//! the session lifecycle and the admin surface. Build one with
//! [`AbuseEngine::builder`].

use crate::application::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfigError},
    history::BehaviorTracker,
    janitor::{InlineMaintenance, MaintenanceConfigError, MaintenanceReport, MaintenanceTask},
    limiter::RateLimiter,
    metrics::Metrics,
    ports::{AuditEvent, AuditSink, Clock, SessionStore, TokenWrapper},
    registry::PolicyRegistry,
    scorer::{RiskConfigError, RiskScorer},
    sessions::{SessionError, SessionManager},
    violations::ViolationRecorder,
};
use crate::domain::{
    context::{CompositeKey, FingerprintSignals, RequestContext},
    fingerprint::{Fingerprint, FingerprintError, FingerprintGenerator},
    policy::{
        Decision, DecisionReason, EndpointPolicy, PolicyEngine, PolicyError, PolicyUpdate,
    },
    risk::RiskFlag,
    session::{Session, SessionConfigError, SessionId},
    violation::{Limiter, Violation},
};
use crate::infrastructure::storage::MemorySessionStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "async")]
use crate::application::janitor::{MaintenanceHandle, ShutdownError};
#[cfg(feature = "async")]
use std::sync::Mutex;

/// A configuration value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Risk scoring configuration
    #[error("risk configuration: {0}")]
    Risk(#[from] RiskConfigError),
    /// Session lifetimes
    #[error("session configuration: {0}")]
    Session(#[from] SessionConfigError),
    /// Endpoint policy or decision thresholds
    #[error("policy configuration: {0}")]
    Policy(#[from] PolicyError),
    /// Circuit breaker
    #[error("circuit breaker configuration: {0}")]
    CircuitBreaker(#[from] CircuitBreakerConfigError),
    /// Maintenance worker
    #[error("maintenance configuration: {0}")]
    Maintenance(#[from] MaintenanceConfigError),
}

/// Errors surfaced to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The counter store is unavailable and the endpoint fails closed
    #[error("counter store unavailable")]
    StoreUnavailable,
    /// Device signals could not be fingerprinted
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(#[from] FingerprintError),
    /// Session operation failed
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Too many requests in the current window
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Time until the window ends
        retry_after: Duration,
    },
    /// The risk score crossed the deny threshold
    #[error("request denied with risk score {score}")]
    RiskDenied {
        /// Score at decision time
        score: u8,
    },
    /// The endpoint policy is malformed and the endpoint fails closed
    #[error("endpoint policy `{0}` is malformed")]
    InvalidPolicy(String),
    /// No policy is registered under this endpoint name
    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),
    /// A configuration value was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of assessing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// Action to take
    pub decision: Decision,
    /// Why
    pub reason: DecisionReason,
    /// The request may proceed, possibly after a challenge or step-up
    pub allowed: bool,
    /// Risk score in `0..=100`
    pub risk_score: u8,
    /// Risk flags in the order they were raised
    pub flags: Vec<RiskFlag>,
    /// A challenge should be presented
    pub require_captcha: bool,
    /// Strong additional verification should be required
    pub require_additional_verification: bool,
    /// When the caller may retry, for counter denials
    pub retry_after: Option<Duration>,
    /// Endpoint policy the request was gated by
    pub endpoint: String,
    /// Identifier the request was counted under
    pub identifier: CompositeKey,
    /// Result of validating the session token carried by the request, if any
    pub session: Option<SessionVerdict>,
}

impl Assessment {
    /// Check whether a flag was raised.
    pub fn has_flag(&self, flag: RiskFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Turn a denial into the matching error, passing anything else through.
    pub fn into_result(self) -> Result<Assessment, GateError> {
        if self.decision != Decision::Deny {
            return Ok(self);
        }
        Err(match self.reason {
            DecisionReason::RateLimitExceeded => GateError::RateLimitExceeded {
                retry_after: self.retry_after.unwrap_or_default(),
            },
            DecisionReason::StoreUnavailable => GateError::StoreUnavailable,
            DecisionReason::InvalidPolicy => GateError::InvalidPolicy(self.endpoint),
            DecisionReason::RiskScore { score } => GateError::RiskDenied { score },
            DecisionReason::WithinLimits => GateError::RiskDenied {
                score: self.risk_score,
            },
        })
    }
}

/// A session as handed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedSession {
    /// Opaque token for the client
    pub token: String,
    /// When the session ends unless used again
    pub expires_at: DateTime<Utc>,
    /// Rotations so far
    pub rotation_count: u32,
    /// An identity is bound to the session
    pub authenticated: bool,
    /// Bound identity
    pub identity: Option<String>,
}

/// Outcome of validating a session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVerdict {
    /// The session is live and bound to this device
    pub valid: bool,
    /// Why the session was rejected
    pub reason: Option<SessionError>,
    /// The origin changed; the caller should rotate the session
    pub require_rotation: bool,
    /// An identity is bound to the session
    pub authenticated: bool,
    /// Bound identity
    pub identity: Option<String>,
}

impl SessionVerdict {
    fn rejected(reason: SessionError) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            require_rotation: false,
            authenticated: false,
            identity: None,
        }
    }
}

/// Adaptive abuse-prevention engine.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct AbuseEngine<S = MemorySessionStore>
where
    S: SessionStore + 'static,
{
    pub(crate) fingerprints: FingerprintGenerator,
    pub(crate) policies: PolicyRegistry,
    pub(crate) limiter: RateLimiter,
    pub(crate) history: BehaviorTracker,
    pub(crate) scorer: RiskScorer,
    pub(crate) decisions: PolicyEngine,
    pub(crate) sessions: Arc<SessionManager<S>>,
    pub(crate) violations: ViolationRecorder,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) tokens: Arc<dyn TokenWrapper>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Metrics,
    pub(crate) inline_maintenance: Option<InlineMaintenance>,
    #[cfg(feature = "async")]
    pub(crate) maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl<S> AbuseEngine<S>
where
    S: SessionStore + 'static,
{
    /// Fingerprint a set of device signals.
    pub fn fingerprint(&self, signals: &FingerprintSignals) -> Result<Fingerprint, GateError> {
        Ok(self.fingerprints.generate(signals)?)
    }

    /// Assess one request.
    ///
    /// Counts the request, scores it, decides, and records any non-allow
    /// outcome. Counter store failures never surface as errors: the
    /// endpoint's fail mode is applied instead.
    ///
    /// # Errors
    /// `InvalidFingerprint` for malformed device signals and
    /// `UnknownEndpoint` when no policy is registered for `ctx.endpoint`.
    /// Neither is counted.
    pub fn assess(&self, ctx: &RequestContext) -> Result<Assessment, GateError> {
        self.maintain_inline();
        let fingerprint = self.fingerprints.generate(&ctx.signals)?;
        let policy = self
            .policies
            .get(&ctx.endpoint)
            .ok_or_else(|| GateError::UnknownEndpoint(ctx.endpoint.clone()))?;

        let identifier = CompositeKey::new(ctx.origin, &fingerprint, &ctx.identity);
        let verdict = self
            .limiter
            .count(&policy, &identifier.counter_key(&policy.name));
        let history = self.history.observe(ctx, &fingerprint);
        let risk = self.scorer.score(ctx, &history);
        let decision = self.decisions.decide(&verdict, &risk, &policy);

        self.metrics.record_decision(decision.action);
        if decision.action != Decision::Allow {
            self.violations.record(Violation {
                timestamp: ctx.timestamp,
                identifier: identifier.as_str().to_string(),
                limiter: Limiter::from_reason(&decision.reason),
                endpoint: policy.name.clone(),
                decision: decision.action,
                score: risk.score,
                flags: risk.flags.clone(),
            });
            self.emit(AuditEvent::Decision {
                timestamp: ctx.timestamp,
                endpoint: policy.name.clone(),
                identifier: identifier.as_str().to_string(),
                decision: decision.action,
                reason: decision.reason,
                score: risk.score,
                flags: risk.flags.clone(),
            });
        }

        tracing::debug!(
            endpoint = %policy.name,
            identifier = %identifier,
            decision = decision.action.as_str(),
            score = risk.score,
            "Request assessed"
        );

        let session = ctx
            .session_token
            .as_deref()
            .map(|token| self.validate_session(token, &fingerprint, ctx.origin));

        Ok(Assessment {
            decision: decision.action,
            reason: decision.reason,
            allowed: decision.action != Decision::Deny,
            risk_score: risk.score,
            require_captcha: risk.require_captcha || decision.action == Decision::Challenge,
            require_additional_verification: risk.require_additional_verification
                || decision.action == Decision::StepUp,
            flags: risk.flags,
            retry_after: decision.retry_after,
            endpoint: policy.name,
            identifier,
            session,
        })
    }

    /// Feed the result of a one-time-code verification into behavior history.
    pub fn record_verification_outcome(&self, identity: &str, success: bool) {
        self.history
            .record_outcome(identity, success, self.clock.now());
        if !success {
            tracing::debug!(identity = %identity, "Verification failure recorded");
        }
    }

    /// Start an unauthenticated session bound to `fingerprint`.
    pub fn create_session(
        &self,
        origin: IpAddr,
        fingerprint: &Fingerprint,
    ) -> Result<IssuedSession, GateError> {
        self.maintain_inline();
        let session = self.sessions.create(origin, fingerprint.clone())?;
        self.emit(AuditEvent::SessionCreated {
            timestamp: session.created_at,
            session: session.id.to_string(),
        });
        Ok(self.issue(&session))
    }

    /// Validate a session token presented from `origin` by `fingerprint`.
    ///
    /// Never fails: store errors and malformed tokens produce an invalid
    /// verdict.
    pub fn validate_session(
        &self,
        token: &str,
        fingerprint: &Fingerprint,
        origin: IpAddr,
    ) -> SessionVerdict {
        let Some(id) = self.tokens.unwrap(token) else {
            return SessionVerdict::rejected(SessionError::NotFound);
        };

        match self.sessions.validate(&id, fingerprint, origin) {
            Ok(validated) => SessionVerdict {
                valid: true,
                reason: None,
                require_rotation: validated.require_rotation,
                authenticated: validated.session.authenticated,
                identity: validated.session.identity,
            },
            Err(error) => {
                self.session_destroyed(&id, &error);
                if let SessionError::Store(store_error) = &error {
                    tracing::error!(error = %store_error, "Session store unavailable, rejecting session");
                }
                SessionVerdict::rejected(error)
            }
        }
    }

    /// Issue a new token for a session, invalidating the old one.
    ///
    /// Returns `Ok(None)` when the session is gone, timed out, or has used
    /// up its rotations (in which case it is destroyed).
    pub fn rotate_session(&self, token: &str) -> Result<Option<IssuedSession>, GateError> {
        let Some(id) = self.tokens.unwrap(token) else {
            return Ok(None);
        };

        match self.sessions.rotate(&id) {
            Ok(next) => {
                self.emit(AuditEvent::SessionRotated {
                    timestamp: next.last_activity,
                    from: id.to_string(),
                    to: next.id.to_string(),
                    rotation_count: next.rotation_count,
                });
                Ok(Some(self.issue(&next)))
            }
            Err(SessionError::Store(error)) => Err(SessionError::Store(error).into()),
            Err(error) => {
                self.session_destroyed(&id, &error);
                Ok(None)
            }
        }
    }

    /// Bind a verified identity to a session.
    pub fn authenticate_session(
        &self,
        token: &str,
        identity: &str,
    ) -> Result<IssuedSession, GateError> {
        let id = self.tokens.unwrap(token).ok_or(SessionError::NotFound)?;
        match self.sessions.authenticate(&id, identity) {
            Ok(session) => {
                self.emit(AuditEvent::SessionAuthenticated {
                    timestamp: session.last_activity,
                    session: session.id.to_string(),
                    identity: identity.to_string(),
                });
                Ok(self.issue(&session))
            }
            Err(error) => {
                self.session_destroyed(&id, &error);
                Err(error.into())
            }
        }
    }

    /// Destroy a session. Returns whether it existed.
    pub fn destroy_session(&self, token: &str) -> Result<bool, GateError> {
        let Some(id) = self.tokens.unwrap(token) else {
            return Ok(false);
        };
        let existed = self.sessions.destroy(&id)?;
        if existed {
            self.emit(AuditEvent::SessionDestroyed {
                timestamp: self.clock.now(),
                session: id.to_string(),
                cause: "destroyed".to_string(),
            });
        }
        Ok(existed)
    }

    /// All endpoint policies, sorted by name.
    pub fn policies(&self) -> Vec<EndpointPolicy> {
        self.policies.all()
    }

    /// The policy for one endpoint.
    pub fn policy(&self, endpoint: &str) -> Option<EndpointPolicy> {
        self.policies.get(endpoint)
    }

    /// Change an endpoint policy at runtime.
    ///
    /// Counters already open keep their window; new windows use the new
    /// settings.
    pub fn update_policy(
        &self,
        endpoint: &str,
        update: &PolicyUpdate,
    ) -> Result<EndpointPolicy, GateError> {
        let updated = self
            .policies
            .update(endpoint, update)
            .map_err(ConfigError::from)?
            .ok_or_else(|| GateError::UnknownEndpoint(endpoint.to_string()))?;

        tracing::info!(
            endpoint = %updated.name,
            window_ms = updated.window_ms,
            max_requests = updated.max_requests,
            enabled = updated.enabled,
            "Endpoint policy updated"
        );
        self.emit(AuditEvent::PolicyUpdated {
            timestamp: self.clock.now(),
            endpoint: updated.name.clone(),
        });
        Ok(updated)
    }

    /// Up to `limit` violations, newest first.
    pub fn recent_violations(&self, limit: usize) -> Vec<Violation> {
        self.violations.recent(limit)
    }

    /// Lifetime violation totals per limiter.
    pub fn violation_counts(&self) -> BTreeMap<Limiter, u64> {
        self.violations.counts_by_limiter()
    }

    /// Reset the counters of `identifier` on every endpoint.
    ///
    /// `identifier` is the value reported in [`Assessment::identifier`] and
    /// [`Violation::identifier`]. Returns the number of endpoints reset.
    pub fn clear_identifier(&self, identifier: &str) -> Result<usize, GateError> {
        let key = CompositeKey::from_raw(identifier);
        let names = self.policies.names();
        for name in &names {
            self.limiter.reset(&key.counter_key(name)).map_err(|error| {
                tracing::error!(identifier = %key, error = %error, "Failed to clear counters");
                GateError::StoreUnavailable
            })?;
        }

        tracing::info!(identifier = %key, endpoints = names.len(), "Identifier counters cleared");
        self.emit(AuditEvent::IdentifierCleared {
            timestamp: self.clock.now(),
            identifier: key.as_str().to_string(),
        });
        Ok(names.len())
    }

    /// Current count of `identifier` on `endpoint`.
    pub fn counter_value(&self, endpoint: &str, identifier: &str) -> Result<u64, GateError> {
        let key = CompositeKey::from_raw(identifier);
        self.limiter
            .get_count(&key.counter_key(endpoint))
            .map_err(|_| GateError::StoreUnavailable)
    }

    /// Engine metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Circuit breaker guarding the counter store.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        self.limiter.circuit_breaker()
    }

    /// Number of live sessions held by the session store.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop the maintenance worker started by the builder, if any.
    #[cfg(feature = "async")]
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let handle = {
            let mut guard = self
                .maintenance
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };

        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        Ok(())
    }

    fn issue(&self, session: &Session) -> IssuedSession {
        IssuedSession {
            token: self.tokens.wrap(&session.id),
            expires_at: session.expires_at,
            rotation_count: session.rotation_count,
            authenticated: session.authenticated,
            identity: session.identity.clone(),
        }
    }

    fn session_destroyed(&self, id: &SessionId, error: &SessionError) {
        if error.destroyed_session() {
            self.emit(AuditEvent::SessionDestroyed {
                timestamp: self.clock.now(),
                session: id.to_string(),
                cause: error.to_string(),
            });
        }
    }

    fn emit(&self, event: AuditEvent) {
        let sink = &self.audit;
        if panic::catch_unwind(AssertUnwindSafe(|| sink.log_event(&event))).is_err() {
            tracing::error!(event = event.name(), "Audit sink panicked, event dropped");
        }
    }
}

/// Purges expired state held by the engine.
///
/// Holds shared handles only, so it can run on a background task while the
/// engine keeps serving.
#[derive(Debug)]
pub(crate) struct EngineJanitor<S: SessionStore + 'static> {
    pub(crate) sessions: Arc<SessionManager<S>>,
    pub(crate) limiter: RateLimiter,
    pub(crate) history: BehaviorTracker,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<S: SessionStore + 'static> MaintenanceTask for EngineJanitor<S> {
    fn run_maintenance(&self) -> MaintenanceReport {
        let sessions = self.sessions.purge_expired().unwrap_or_else(|error| {
            tracing::warn!(error = %error, "Session purge failed");
            0
        });
        MaintenanceReport {
            sessions,
            counters: self.limiter.purge_expired(),
            history: self.history.purge(self.clock.now()),
        }
    }
}

impl<S: SessionStore + 'static> AbuseEngine<S> {
    pub(crate) fn janitor(&self) -> EngineJanitor<S> {
        EngineJanitor {
            sessions: Arc::clone(&self.sessions),
            limiter: self.limiter.clone(),
            history: self.history.clone(),
            clock: Arc::clone(&self.clock),
        }
    }

    fn maintain_inline(&self) {
        let Some(inline) = &self.inline_maintenance else {
            return;
        };
        if !inline.due(self.clock.now()) {
            return;
        }
        let report = self.janitor().run_maintenance();
        if report.total() > 0 {
            tracing::debug!(
                sessions = report.sessions,
                counters = report.counters,
                history = report.history,
                "Inline maintenance removed expired entries"
            );
        }
    }
}

impl<S: SessionStore + 'static> MaintenanceTask for AbuseEngine<S> {
    fn run_maintenance(&self) -> MaintenanceReport {
        self.janitor().run_maintenance()
    }
}
