//! Records of non-allow outcomes.

use crate::domain::policy::{Decision, DecisionReason};
use crate::domain::risk::RiskFlag;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One denied, challenged or stepped-up request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// Composite identifier the request was counted under
    pub identifier: String,
    /// Which limiter produced the outcome
    pub limiter: Limiter,
    /// Endpoint policy name
    pub endpoint: String,
    /// Action taken
    pub decision: Decision,
    /// Risk score at decision time
    pub score: u8,
    /// Flags raised
    pub flags: Vec<RiskFlag>,
}

/// Source of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Limiter {
    /// The fixed-window request counter
    Counter,
    /// The risk scorer
    Risk,
    /// The counter store was unreachable
    Store,
    /// The endpoint policy was malformed
    Policy,
}

impl Limiter {
    /// The limiter responsible for a decision reason.
    pub fn from_reason(reason: &DecisionReason) -> Self {
        match reason {
            DecisionReason::RateLimitExceeded => Limiter::Counter,
            DecisionReason::StoreUnavailable => Limiter::Store,
            DecisionReason::InvalidPolicy => Limiter::Policy,
            DecisionReason::RiskScore { .. } | DecisionReason::WithinLimits => Limiter::Risk,
        }
    }

    /// Stable name for logs and counts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Limiter::Counter => "counter",
            Limiter::Risk => "risk",
            Limiter::Store => "store",
            Limiter::Policy => "policy",
        }
    }
}
