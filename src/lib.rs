//! # abuse-gate
//!
//! Adaptive abuse prevention for one-time-code issuance, code verification and
//! account writes.
//!
//! Every request is reduced to a composite identifier (origin, device
//! fingerprint and identity), counted against a fixed-window endpoint policy,
//! scored for risk from network reputation, identity trust and recent
//! behavior, and answered with one of four decisions: allow, challenge,
//! step-up or deny. Sessions are bound to the device that created them and
//! rotated when the network origin changes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use abuse_gate::{AbuseEngine, Decision, FingerprintSignals, RequestContext};
//! use chrono::Utc;
//!
//! let engine = AbuseEngine::builder().build().unwrap();
//!
//! let ctx = RequestContext::new(
//!     "code-delivery",
//!     "+33612480931",
//!     "81.2.69.160".parse().unwrap(),
//!     FingerprintSignals::new("Mozilla/5.0").with_timezone("Europe/Paris"),
//!     Utc::now(),
//! );
//!
//! let assessment = engine.assess(&ctx).unwrap();
//! match assessment.decision {
//!     Decision::Allow => { /* send the code */ }
//!     Decision::Challenge => { /* present a captcha first */ }
//!     Decision::StepUp => { /* require stronger verification */ }
//!     Decision::Deny => { /* refuse, honoring assessment.retry_after */ }
//! }
//! ```
//!
//! ## Features
//!
//! ### Decision Pipeline
//! - **Fingerprinting**: SHA-256 over canonical, length-prefixed device signals
//! - **Fixed-window counters**: per endpoint and composite identifier
//! - **Risk scoring**: additive, category-capped, explainable flags
//! - **Policy engine**: merges the counter verdict and the risk score
//!
//! ### Failure Handling
//! - **Fail modes per endpoint class**: reads fail open, everything else fails closed
//! - **Circuit breaker**: skips the counter store after repeated failures
//! - **Contained collaborators**: a panicking store or audit sink never breaks a decision
//!
//! ### Sessions
//! - 256-bit random ids, bound to a device fingerprint
//! - Idle and absolute timeouts enforced independently
//! - Bounded rotation carrying identity and creation time
//!
//! ## Fail Modes
//!
//! | Class | When the counter store is down |
//! |-------|--------------------------------|
//! | `Read` | Fail open: decided on risk score alone |
//! | `Authentication`, `CodeDelivery`, `CodeVerification`, `Administrative`, `Write` | Fail closed: `Deny` |
//!
//! ## Storage Backends
//!
//! In-memory stores are the default. Enable the `redis-storage` feature to
//! share counters and sessions across instances with
//! [`RedisCounterStore`] and [`RedisSessionStore`].
//!
//! ## Maintenance
//!
//! In-memory counters, expired sessions and behavior history are purged once
//! a minute by the request path. The maintenance worker (`async` feature)
//! moves that work to a background task:
//!
//! ```rust,no_run
//! # use abuse_gate::{AbuseEngine, MaintenanceConfig};
//! # use std::time::Duration;
//! # async fn example() {
//! let engine = AbuseEngine::builder()
//!     .with_maintenance(MaintenanceConfig::new(Duration::from_secs(60)).unwrap())
//!     .build()
//!     .unwrap();
//!
//! // Serve requests...
//!
//! engine.shutdown().await.expect("shutdown failed");
//! # }
//! ```
//!
//! ## Observability
//!
//! Decisions are logged at `debug`, degradations at `warn`/`error`, and audit
//! events go to the `abuse_gate::audit` target. [`Metrics`] exposes atomic
//! counters through [`MetricsSnapshot`].

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    context::{CompositeKey, FingerprintSignals, NetworkInfo, RequestContext},
    fingerprint::{Fingerprint, FingerprintError, FingerprintGenerator},
    policy::{
        CounterResult, CounterVerdict, Decision, DecisionReason, EndpointClass, EndpointPolicy,
        FailMode, PolicyDecision, PolicyEngine, PolicyError, PolicyUpdate,
    },
    risk::{DecisionThresholds, RiskAssessment, RiskCategory, RiskFlag, ThresholdError},
    session::{Session, SessionConfig, SessionConfigError, SessionId},
    violation::{Limiter, Violation},
};

pub use application::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    history::{BehaviorHistory, BehaviorTracker},
    janitor::{
        Maintenance, MaintenanceConfig, MaintenanceConfigError, MaintenanceReport,
        MaintenanceTask, ShutdownError,
    },
    metrics::{Metrics, MetricsSnapshot},
    ports::{AuditEvent, AuditSink, Clock, CounterStore, SessionStore, StoreError, TokenWrapper},
    registry::PolicyRegistry,
    scorer::{BehaviorLimits, BehaviorWindows, RiskConfig, RiskConfigError, RiskScorer},
    sessions::{SessionError, SessionManager},
    violations::ViolationRecorder,
};

#[cfg(feature = "async")]
pub use application::janitor::MaintenanceHandle;

pub use infrastructure::{
    audit::TracingAuditSink,
    builder::{AbuseEngineBuilder, BuildError},
    clock::SystemClock,
    engine::{AbuseEngine, Assessment, ConfigError, GateError, IssuedSession, SessionVerdict},
    storage::{MemoryCounterStore, MemorySessionStore},
    tokens::PlainTokens,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_storage::{
    RedisConnectError, RedisCounterStore, RedisSessionStore, RedisStorageConfig,
};
