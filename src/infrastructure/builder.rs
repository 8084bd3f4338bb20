//! Builder for [`AbuseEngine`].

use crate::application::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    history::BehaviorTracker,
    janitor::{InlineMaintenance, MaintenanceConfig},
    limiter::RateLimiter,
    metrics::Metrics,
    ports::{AuditSink, Clock, CounterStore, SessionStore, TokenWrapper},
    registry::PolicyRegistry,
    scorer::{RiskConfig, RiskScorer},
    sessions::SessionManager,
    violations::{ViolationRecorder, DEFAULT_VIOLATION_CAPACITY},
};
use crate::domain::{
    fingerprint::FingerprintGenerator,
    policy::{EndpointPolicy, PolicyEngine},
    risk::DecisionThresholds,
    session::SessionConfig,
};
use crate::infrastructure::{
    audit::TracingAuditSink,
    clock::SystemClock,
    engine::{AbuseEngine, ConfigError},
    storage::{MemoryCounterStore, MemorySessionStore},
    tokens::PlainTokens,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "async")]
use crate::application::janitor::Maintenance;
#[cfg(feature = "async")]
use std::sync::Mutex;

/// Error returned when building an [`AbuseEngine`] fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A configuration value was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No endpoint policies were configured
    #[error("at least one endpoint policy is required")]
    NoPolicies,
    /// Violation log capacity must be greater than zero
    #[error("violation capacity must be greater than 0")]
    ZeroViolationCapacity,
    /// Background maintenance needs a running tokio runtime
    #[error("maintenance worker requires a tokio runtime")]
    NoRuntime,
}

/// Configures and builds an [`AbuseEngine`].
///
/// Every component has a production default: in-memory stores, the system
/// clock, the default endpoint policies, audit events written to `tracing`
/// and raw session ids as tokens.
#[derive(Debug)]
pub struct AbuseEngineBuilder<S = MemorySessionStore>
where
    S: SessionStore + 'static,
{
    clock: Option<Arc<dyn Clock>>,
    counter_store: Option<Arc<dyn CounterStore>>,
    session_store: Arc<S>,
    audit: Option<Arc<dyn AuditSink>>,
    tokens: Option<Arc<dyn TokenWrapper>>,
    policies: BTreeMap<String, EndpointPolicy>,
    risk: RiskConfig,
    session: SessionConfig,
    circuit_breaker: CircuitBreakerConfig,
    violation_capacity: usize,
    maintenance: Option<MaintenanceConfig>,
}

impl AbuseEngine<MemorySessionStore> {
    /// Create a builder for configuring the engine.
    ///
    /// Defaults:
    /// - Policies: `auth`, `code-delivery`, `code-verification`, `admin`, `read`, `write`
    /// - Thresholds: challenge 30, step-up 70, deny 90
    /// - Sessions: 30 minute idle timeout, 24 hour absolute timeout, 10 rotations
    /// - Violation log: 1024 entries
    /// - Maintenance worker: disabled
    pub fn builder() -> AbuseEngineBuilder<MemorySessionStore> {
        AbuseEngineBuilder {
            clock: None,
            counter_store: None,
            session_store: Arc::new(MemorySessionStore::new()),
            audit: None,
            tokens: None,
            policies: EndpointPolicy::defaults()
                .into_iter()
                .map(|policy| (policy.name.clone(), policy))
                .collect(),
            risk: RiskConfig::default(),
            session: SessionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            violation_capacity: DEFAULT_VIOLATION_CAPACITY,
            maintenance: None,
        }
    }
}

impl<S> AbuseEngineBuilder<S>
where
    S: SessionStore + 'static,
{
    /// Set the clock used for counters, sessions and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a shared counter store, e.g. Redis, instead of the in-memory one.
    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Use another session table.
    pub fn with_session_store<T>(self, store: Arc<T>) -> AbuseEngineBuilder<T>
    where
        T: SessionStore + 'static,
    {
        AbuseEngineBuilder {
            clock: self.clock,
            counter_store: self.counter_store,
            session_store: store,
            audit: self.audit,
            tokens: self.tokens,
            policies: self.policies,
            risk: self.risk,
            session: self.session,
            circuit_breaker: self.circuit_breaker,
            violation_capacity: self.violation_capacity,
            maintenance: self.maintenance,
        }
    }

    /// Send audit events to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Wrap session ids with `tokens` before handing them out.
    pub fn with_token_wrapper(mut self, tokens: Arc<dyn TokenWrapper>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Add or replace one endpoint policy.
    pub fn with_policy(mut self, policy: EndpointPolicy) -> Self {
        self.policies.insert(policy.name.clone(), policy);
        self
    }

    /// Replace all endpoint policies.
    pub fn with_policies(mut self, policies: impl IntoIterator<Item = EndpointPolicy>) -> Self {
        self.policies = policies
            .into_iter()
            .map(|policy| (policy.name.clone(), policy))
            .collect();
        self
    }

    /// Set the risk scoring configuration.
    pub fn with_risk_config(mut self, config: RiskConfig) -> Self {
        self.risk = config;
        self
    }

    /// Set the decision thresholds.
    pub fn with_thresholds(mut self, thresholds: DecisionThresholds) -> Self {
        self.risk.thresholds = thresholds;
        self
    }

    /// Set session lifetimes and the rotation budget.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Set the counter store circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set how many violations are kept for inspection.
    pub fn with_violation_capacity(mut self, capacity: usize) -> Self {
        self.violation_capacity = capacity;
        self
    }

    /// Run the maintenance worker in the background.
    ///
    /// **Requires the `async` feature** and a running tokio runtime at
    /// [`build`](Self::build) time. Stop it with [`AbuseEngine::shutdown`].
    pub fn with_maintenance(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = Some(config);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    /// Returns `BuildError` if any configuration is invalid.
    pub fn build(self) -> Result<AbuseEngine<S>, BuildError> {
        if self.policies.is_empty() {
            return Err(BuildError::NoPolicies);
        }
        if self.violation_capacity == 0 {
            return Err(BuildError::ZeroViolationCapacity);
        }

        self.risk.validate().map_err(ConfigError::from)?;
        self.session.validate().map_err(ConfigError::from)?;
        self.circuit_breaker.validate().map_err(ConfigError::from)?;
        if let Some(maintenance) = &self.maintenance {
            maintenance.validate().map_err(ConfigError::from)?;
        }

        let registry = PolicyRegistry::new();
        for policy in self.policies.into_values() {
            registry.insert(policy).map_err(ConfigError::from)?;
        }

        let metrics = Metrics::new();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let counter_store = self
            .counter_store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new(Arc::clone(&clock))));
        let circuit_breaker = Arc::new(CircuitBreaker::new(self.circuit_breaker, Arc::clone(&clock)));

        let decisions = PolicyEngine::new(self.risk.thresholds).map_err(ConfigError::from)?;
        let history = BehaviorTracker::new(self.risk.history_retention());
        let scorer = RiskScorer::new(self.risk).map_err(ConfigError::from)?;
        let sessions = SessionManager::new(
            self.session_store,
            Arc::clone(&clock),
            self.session,
            metrics.clone(),
        );

        // Without a background worker, request traffic drives the purge
        let inline_maintenance = self
            .maintenance
            .is_none()
            .then(|| InlineMaintenance::new(MaintenanceConfig::default().interval, clock.now()));

        let engine = AbuseEngine {
            fingerprints: FingerprintGenerator::new(),
            policies: registry,
            limiter: RateLimiter::new(counter_store, metrics.clone(), circuit_breaker),
            history,
            scorer,
            decisions,
            sessions: Arc::new(sessions),
            violations: ViolationRecorder::new(self.violation_capacity),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink::new())),
            tokens: self.tokens.unwrap_or_else(|| Arc::new(PlainTokens::new())),
            clock,
            metrics,
            inline_maintenance,
            #[cfg(feature = "async")]
            maintenance: Mutex::new(None),
        };

        #[cfg(feature = "async")]
        {
            if let Some(config) = self.maintenance {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(BuildError::NoRuntime);
                }
                let handle = Maintenance::start(engine.janitor(), config);
                *engine
                    .maintenance
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
            }
        }

        #[cfg(not(feature = "async"))]
        {
            if self.maintenance.is_some() {
                return Err(BuildError::NoRuntime);
            }
        }

        tracing::info!(
            endpoints = engine.policies.len(),
            "Abuse engine built"
        );
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::{FingerprintSignals, RequestContext};
    use crate::domain::policy::EndpointClass;
    use crate::domain::risk::RiskFlag;
    use crate::domain::session::{SessionConfigError, SessionId};
    use std::time::Duration;

    #[test]
    fn test_defaults_build() {
        let engine = AbuseEngine::builder().build().unwrap();
        let names: Vec<String> = engine.policies().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["admin", "auth", "code-delivery", "code-verification", "read", "write"]
        );
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let result = AbuseEngine::builder()
            .with_session_config(SessionConfig {
                idle_timeout_ms: 0,
                ..SessionConfig::default()
            })
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::Session(SessionConfigError::ZeroTimeout)))
        ));

        assert!(matches!(
            AbuseEngine::builder().with_policies(Vec::new()).build(),
            Err(BuildError::NoPolicies)
        ));
        assert!(matches!(
            AbuseEngine::builder().with_violation_capacity(0).build(),
            Err(BuildError::ZeroViolationCapacity)
        ));
    }

    #[test]
    fn test_rejects_malformed_policy() {
        let mut policy = EndpointPolicy::new(
            "export",
            EndpointClass::Write,
            Duration::from_secs(60),
            10,
        )
        .unwrap();
        policy.max_requests = 0;

        assert!(matches!(
            AbuseEngine::builder().with_policy(policy).build(),
            Err(BuildError::Config(ConfigError::Policy(_)))
        ));
    }

    #[derive(Debug)]
    struct PrefixedTokens;

    impl TokenWrapper for PrefixedTokens {
        fn wrap(&self, id: &SessionId) -> String {
            format!("v1.{}", id.as_str())
        }

        fn unwrap(&self, token: &str) -> Option<SessionId> {
            token.strip_prefix("v1.").map(SessionId::new)
        }
    }

    #[test]
    fn test_custom_token_wrapper() {
        let engine = AbuseEngine::builder()
            .with_token_wrapper(Arc::new(PrefixedTokens))
            .build()
            .unwrap();
        let fingerprint = engine
            .fingerprint(&FingerprintSignals::new("Mozilla/5.0"))
            .unwrap();
        let origin = "81.2.69.160".parse().unwrap();

        let issued = engine.create_session(origin, &fingerprint).unwrap();
        assert!(issued.token.starts_with("v1."));
        assert!(engine.validate_session(&issued.token, &fingerprint, origin).valid);

        let raw = issued.token.trim_start_matches("v1.");
        assert!(!engine.validate_session(raw, &fingerprint, origin).valid);
    }

    #[test]
    fn test_custom_risk_config() {
        let engine = AbuseEngine::builder()
            .with_risk_config(RiskConfig {
                proxy_ranges: vec!["185.220.100.0/22".parse().unwrap()],
                ..RiskConfig::default()
            })
            .build()
            .unwrap();

        let ctx = RequestContext::new(
            "read",
            "+33612480931",
            "185.220.101.4".parse().unwrap(),
            FingerprintSignals::new("Mozilla/5.0"),
            chrono::Utc::now(),
        );
        let assessment = engine.assess(&ctx).unwrap();
        assert_eq!(assessment.flags, vec![RiskFlag::KnownProxyRange]);
        assert_eq!(assessment.risk_score, 40);
    }

    #[test]
    fn test_maintenance_without_runtime() {
        let result = AbuseEngine::builder()
            .with_maintenance(MaintenanceConfig::default())
            .build();
        assert!(matches!(result, Err(BuildError::NoRuntime)));
    }
}
