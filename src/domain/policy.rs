//! Endpoint policies and the decision function.
//!
//! Every gated endpoint has an [`EndpointPolicy`] describing its counting
//! window, request ceiling and sensitivity class. The [`PolicyEngine`] merges
//! the hard counter verdict with the soft risk score into one [`Decision`].

use crate::domain::risk::{DecisionThresholds, RiskAssessment, ThresholdError, MAX_SCORE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Longest counting window accepted (30 days).
pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Let the request through on risk score alone
    Open,
    /// Deny the request
    Closed,
}

/// Sensitivity class of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Login and credential checks
    Authentication,
    /// Sending a one-time code
    CodeDelivery,
    /// Checking a one-time code
    CodeVerification,
    /// Operator tooling
    Administrative,
    /// Low-sensitivity reads
    Read,
    /// Account writes
    Write,
}

impl EndpointClass {
    /// Pre-declared behavior when the counter store is unavailable.
    ///
    /// Only plain reads fail open. Anything that issues or checks codes,
    /// authenticates, or mutates state fails closed.
    pub fn fail_mode(&self) -> FailMode {
        match self {
            EndpointClass::Read => FailMode::Open,
            EndpointClass::Authentication
            | EndpointClass::CodeDelivery
            | EndpointClass::CodeVerification
            | EndpointClass::Administrative
            | EndpointClass::Write => FailMode::Closed,
        }
    }

    /// Whether the class fails closed.
    pub fn is_sensitive(&self) -> bool {
        self.fail_mode() == FailMode::Closed
    }
}

/// Errors in endpoint policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Policy name is empty
    #[error("policy name must not be empty")]
    EmptyName,
    /// Window is zero
    #[error("policy `{0}`: window must be greater than 0")]
    ZeroWindow(String),
    /// Window is longer than [`MAX_WINDOW_MS`]
    #[error("policy `{0}`: window exceeds {MAX_WINDOW_MS} ms")]
    WindowTooLong(String),
    /// Max requests is zero
    #[error("policy `{0}`: max_requests must be greater than 0")]
    ZeroMaxRequests(String),
    /// Severity threshold exceeds the maximum score
    #[error("policy `{0}`: severity threshold exceeds {MAX_SCORE}")]
    SeverityOutOfRange(String),
    /// Decision thresholds are invalid
    #[error(transparent)]
    Thresholds(#[from] ThresholdError),
}

/// Rate and risk policy for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Endpoint name, e.g. `code-delivery`
    pub name: String,
    /// Sensitivity class
    pub class: EndpointClass,
    /// Counting window in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window
    pub max_requests: u64,
    /// When false the counter is skipped; risk scoring still applies
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Deny at this score instead of the global deny threshold, if lower
    #[serde(default)]
    pub severity_threshold: Option<u8>,
}

fn default_enabled() -> bool {
    true
}

impl EndpointPolicy {
    /// Create a validated, enabled policy.
    ///
    /// # Errors
    /// Returns [`PolicyError`] when the window or ceiling is out of range.
    pub fn new(
        name: impl Into<String>,
        class: EndpointClass,
        window: Duration,
        max_requests: u64,
    ) -> Result<Self, PolicyError> {
        let policy = Self {
            name: name.into(),
            class,
            window_ms: window.as_millis().try_into().unwrap_or(u64::MAX),
            max_requests,
            enabled: true,
            severity_threshold: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Set the per-endpoint deny threshold.
    pub fn with_severity_threshold(mut self, threshold: u8) -> Self {
        self.severity_threshold = Some(threshold);
        self
    }

    /// The counting window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Behavior when the counter store is unavailable.
    pub fn fail_mode(&self) -> FailMode {
        self.class.fail_mode()
    }

    /// Check every range invariant.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }
        if self.window_ms == 0 {
            return Err(PolicyError::ZeroWindow(self.name.clone()));
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(PolicyError::WindowTooLong(self.name.clone()));
        }
        if self.max_requests == 0 {
            return Err(PolicyError::ZeroMaxRequests(self.name.clone()));
        }
        if matches!(self.severity_threshold, Some(t) if t > MAX_SCORE) {
            return Err(PolicyError::SeverityOutOfRange(self.name.clone()));
        }
        Ok(())
    }

    /// Apply an admin update, returning the new policy.
    ///
    /// The receiver is left untouched, so a rejected update changes nothing.
    pub fn apply(&self, update: &PolicyUpdate) -> Result<EndpointPolicy, PolicyError> {
        let mut next = self.clone();
        if let Some(window_ms) = update.window_ms {
            next.window_ms = window_ms;
        }
        if let Some(max_requests) = update.max_requests {
            next.max_requests = max_requests;
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(severity) = update.severity_threshold {
            next.severity_threshold = severity;
        }
        next.validate()?;
        Ok(next)
    }

    /// The built-in policy set.
    pub fn defaults() -> Vec<EndpointPolicy> {
        const MINUTE: u64 = 60 * 1000;
        let policy = |name: &str, class, window_ms, max_requests| EndpointPolicy {
            name: name.to_string(),
            class,
            window_ms,
            max_requests,
            enabled: true,
            severity_threshold: None,
        };

        vec![
            policy("auth", EndpointClass::Authentication, 15 * MINUTE, 5),
            policy("code-delivery", EndpointClass::CodeDelivery, 60 * MINUTE, 3),
            policy("code-verification", EndpointClass::CodeVerification, 15 * MINUTE, 5),
            policy("admin", EndpointClass::Administrative, MINUTE, 30),
            policy("read", EndpointClass::Read, MINUTE, 100),
            policy("write", EndpointClass::Write, MINUTE, 20),
        ]
    }
}

/// Partial update to an [`EndpointPolicy`]; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyUpdate {
    /// New window in milliseconds
    pub window_ms: Option<u64>,
    /// New request ceiling
    pub max_requests: Option<u64>,
    /// Enable or disable the counter
    pub enabled: Option<bool>,
    /// `Some(None)` clears the per-endpoint deny threshold
    pub severity_threshold: Option<Option<u8>>,
}

/// Result of one atomic counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    /// Count after the increment
    pub count: u64,
    /// Time until the window resets
    pub ttl_remaining: Duration,
}

/// What the counter stage produced for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterVerdict {
    /// The counter was incremented
    Counted(CounterResult),
    /// The policy is disabled, nothing was counted
    Skipped,
    /// The store could not be reached
    Unavailable,
}

/// Action to take for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Proceed
    Allow,
    /// Require a proof-of-humanity challenge
    Challenge,
    /// Require strong additional verification
    StepUp,
    /// Refuse
    Deny,
}

impl Decision {
    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Challenge => "challenge",
            Decision::StepUp => "step_up",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DecisionReason {
    /// Under the counter ceiling with a low risk score
    WithinLimits,
    /// The risk score crossed a threshold
    RiskScore {
        /// Score that crossed the threshold
        score: u8,
    },
    /// The counter ceiling was exceeded
    RateLimitExceeded,
    /// The counter store was unavailable and the endpoint fails closed
    StoreUnavailable,
    /// The endpoint policy is malformed and the endpoint fails closed
    InvalidPolicy,
}

/// A decision with its explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    /// Action to take
    pub action: Decision,
    /// Why
    pub reason: DecisionReason,
    /// When the caller may retry, for counter denials
    pub retry_after: Option<Duration>,
}

impl PolicyDecision {
    fn deny(reason: DecisionReason, retry_after: Option<Duration>) -> Self {
        Self {
            action: Decision::Deny,
            reason,
            retry_after,
        }
    }
}

/// Stateless decision function over counter verdicts and risk assessments.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine {
    thresholds: DecisionThresholds,
}

impl PolicyEngine {
    /// Create an engine with validated thresholds.
    pub fn new(thresholds: DecisionThresholds) -> Result<Self, PolicyError> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    /// The configured thresholds.
    pub fn thresholds(&self) -> &DecisionThresholds {
        &self.thresholds
    }

    /// Decide what to do with a request.
    ///
    /// Never fails: a malformed policy yields the safest decision for its
    /// class and is logged for operators.
    pub fn decide(
        &self,
        verdict: &CounterVerdict,
        assessment: &RiskAssessment,
        policy: &EndpointPolicy,
    ) -> PolicyDecision {
        if let Err(error) = policy.validate() {
            tracing::error!(
                endpoint = %policy.name,
                class = ?policy.class,
                window_ms = policy.window_ms,
                max_requests = policy.max_requests,
                error = %error,
                "Malformed endpoint policy, applying fallback decision"
            );
            return match policy.fail_mode() {
                FailMode::Closed => PolicyDecision::deny(DecisionReason::InvalidPolicy, None),
                FailMode::Open => self.risk_decision(assessment, self.thresholds.deny),
            };
        }

        match verdict {
            CounterVerdict::Unavailable if policy.fail_mode() == FailMode::Closed => {
                return PolicyDecision::deny(DecisionReason::StoreUnavailable, None);
            }
            CounterVerdict::Counted(result) if result.count > policy.max_requests => {
                return PolicyDecision::deny(
                    DecisionReason::RateLimitExceeded,
                    Some(result.ttl_remaining),
                );
            }
            _ => {}
        }

        let deny_at = policy
            .severity_threshold
            .map_or(self.thresholds.deny, |t| t.min(self.thresholds.deny));
        self.risk_decision(assessment, deny_at)
    }

    fn risk_decision(&self, assessment: &RiskAssessment, deny_at: u8) -> PolicyDecision {
        let score = assessment.score;
        let action = if score >= deny_at {
            Decision::Deny
        } else if score >= self.thresholds.step_up {
            Decision::StepUp
        } else if score >= self.thresholds.challenge {
            Decision::Challenge
        } else {
            Decision::Allow
        };

        let reason = match action {
            Decision::Allow => DecisionReason::WithinLimits,
            _ => DecisionReason::RiskScore { score },
        };

        PolicyDecision {
            action,
            reason,
            retry_after: None,
        }
    }
}
