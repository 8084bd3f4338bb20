//! Risk flags, score combination and assessments.
//!
//! Every signal the scorer can raise is a [`RiskFlag`] with a fixed weight
//! and category. Scores are combined strictly additively:
//! 1. Sum the weights of each category's flags
//! 2. Cap the network and identity categories at [`CATEGORY_CAP`]
//! 3. Sum the categories and clamp to [`MAX_SCORE`]
//!
//! Each step is monotonic, so adding a flag never lowers the score.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound of every risk score.
pub const MAX_SCORE: u8 = 100;

/// Maximum contribution of a capped category.
pub const CATEGORY_CAP: u32 = 50;

/// Family a flag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    /// Reputation of the origin address
    Network,
    /// Trust in the identity reference
    Identity,
    /// Anomalies in recent behavior
    Behavior,
}

impl RiskCategory {
    /// Cap applied to this category's summed weight, if any.
    pub fn cap(&self) -> Option<u32> {
        match self {
            RiskCategory::Network | RiskCategory::Identity => Some(CATEGORY_CAP),
            RiskCategory::Behavior => None,
        }
    }
}

/// A named, explainable reason contributing to a risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    /// Origin is in a private, reserved or otherwise non-routable range
    PrivateOrReservedIp,
    /// Origin is in a configured proxy/VPN range
    KnownProxyRange,
    /// Origin belongs to a hosting provider
    DatacenterNetwork,
    /// Identity is not a well-formed E.164 number
    MalformedPhone,
    /// Identity starts with a known virtual-number prefix
    VirtualNumber,
    /// Identity matches a disposable-number digit pattern
    DisposableNumber,
    /// Identity used from too many origins recently
    MultipleIpsShortTime,
    /// Identity used from too many devices recently
    MultipleDevicesShortTime,
    /// Identity active at unusual hours too often
    UnusualHourActivity,
    /// One source cycling through many identities
    PhoneEnumeration,
    /// One source sending too many requests
    HighRequestVelocity,
    /// Identity failed verification repeatedly
    RepeatedVerificationFailures,
}

impl RiskFlag {
    /// All flags, in declaration order.
    pub const ALL: [RiskFlag; 12] = [
        RiskFlag::PrivateOrReservedIp,
        RiskFlag::KnownProxyRange,
        RiskFlag::DatacenterNetwork,
        RiskFlag::MalformedPhone,
        RiskFlag::VirtualNumber,
        RiskFlag::DisposableNumber,
        RiskFlag::MultipleIpsShortTime,
        RiskFlag::MultipleDevicesShortTime,
        RiskFlag::UnusualHourActivity,
        RiskFlag::PhoneEnumeration,
        RiskFlag::HighRequestVelocity,
        RiskFlag::RepeatedVerificationFailures,
    ];

    /// Points this flag contributes before category capping.
    pub fn weight(&self) -> u32 {
        match self {
            RiskFlag::PrivateOrReservedIp => 45,
            RiskFlag::KnownProxyRange => 40,
            RiskFlag::DatacenterNetwork => 30,
            RiskFlag::MalformedPhone => 20,
            RiskFlag::VirtualNumber => 40,
            RiskFlag::DisposableNumber => 50,
            RiskFlag::MultipleIpsShortTime => 30,
            RiskFlag::MultipleDevicesShortTime => 40,
            RiskFlag::UnusualHourActivity => 20,
            RiskFlag::PhoneEnumeration => 50,
            RiskFlag::HighRequestVelocity => 20,
            RiskFlag::RepeatedVerificationFailures => 25,
        }
    }

    /// Category this flag belongs to.
    pub fn category(&self) -> RiskCategory {
        match self {
            RiskFlag::PrivateOrReservedIp
            | RiskFlag::KnownProxyRange
            | RiskFlag::DatacenterNetwork => RiskCategory::Network,
            RiskFlag::MalformedPhone | RiskFlag::VirtualNumber | RiskFlag::DisposableNumber => {
                RiskCategory::Identity
            }
            RiskFlag::MultipleIpsShortTime
            | RiskFlag::MultipleDevicesShortTime
            | RiskFlag::UnusualHourActivity
            | RiskFlag::PhoneEnumeration
            | RiskFlag::HighRequestVelocity
            | RiskFlag::RepeatedVerificationFailures => RiskCategory::Behavior,
        }
    }

    /// Stable wire name, e.g. `PHONE_ENUMERATION`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::PrivateOrReservedIp => "PRIVATE_OR_RESERVED_IP",
            RiskFlag::KnownProxyRange => "KNOWN_PROXY_RANGE",
            RiskFlag::DatacenterNetwork => "DATACENTER_NETWORK",
            RiskFlag::MalformedPhone => "MALFORMED_PHONE",
            RiskFlag::VirtualNumber => "VIRTUAL_NUMBER",
            RiskFlag::DisposableNumber => "DISPOSABLE_NUMBER",
            RiskFlag::MultipleIpsShortTime => "MULTIPLE_IPS_SHORT_TIME",
            RiskFlag::MultipleDevicesShortTime => "MULTIPLE_DEVICES_SHORT_TIME",
            RiskFlag::UnusualHourActivity => "UNUSUAL_HOUR_ACTIVITY",
            RiskFlag::PhoneEnumeration => "PHONE_ENUMERATION",
            RiskFlag::HighRequestVelocity => "HIGH_REQUEST_VELOCITY",
            RiskFlag::RepeatedVerificationFailures => "REPEATED_VERIFICATION_FAILURES",
        }
    }

    /// Combine a set of flags into a score in `0..=MAX_SCORE`.
    ///
    /// Duplicate flags count once.
    pub fn combine(flags: &[RiskFlag]) -> u8 {
        let mut seen = [false; RiskFlag::ALL.len()];
        let mut network = 0u32;
        let mut identity = 0u32;
        let mut behavior = 0u32;

        for flag in flags {
            let idx = *flag as usize;
            if seen[idx] {
                continue;
            }
            seen[idx] = true;

            match flag.category() {
                RiskCategory::Network => network += flag.weight(),
                RiskCategory::Identity => identity += flag.weight(),
                RiskCategory::Behavior => behavior += flag.weight(),
            }
        }

        let capped = |category: RiskCategory, sum: u32| match category.cap() {
            Some(cap) => sum.min(cap),
            None => sum,
        };

        let total = capped(RiskCategory::Network, network)
            + capped(RiskCategory::Identity, identity)
            + capped(RiskCategory::Behavior, behavior);

        total.min(MAX_SCORE as u32) as u8
    }
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in threshold configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThresholdError {
    /// A threshold exceeds [`MAX_SCORE`]
    #[error("threshold {0} exceeds the maximum score of {MAX_SCORE}")]
    OutOfRange(u8),
    /// Thresholds are not strictly increasing
    #[error("thresholds must satisfy challenge < step_up < deny")]
    OutOfOrder,
}

/// Score boundaries for each escalation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    /// Score at which a proof-of-humanity challenge is required
    pub challenge: u8,
    /// Score at which strong additional verification is required
    pub step_up: u8,
    /// Score at which the request is denied
    pub deny: u8,
}

impl DecisionThresholds {
    /// Create validated thresholds.
    ///
    /// # Errors
    /// Returns [`ThresholdError`] if any value exceeds [`MAX_SCORE`] or the
    /// values are not strictly increasing.
    pub fn new(challenge: u8, step_up: u8, deny: u8) -> Result<Self, ThresholdError> {
        let thresholds = Self {
            challenge,
            step_up,
            deny,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Check the range and ordering invariants.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        for value in [self.challenge, self.step_up, self.deny] {
            if value > MAX_SCORE {
                return Err(ThresholdError::OutOfRange(value));
            }
        }
        if !(self.challenge < self.step_up && self.step_up < self.deny) {
            return Err(ThresholdError::OutOfOrder);
        }
        Ok(())
    }
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            challenge: 30,
            step_up: 70,
            deny: 90,
        }
    }
}

/// Outcome of scoring one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    /// Combined score in `0..=100`
    pub score: u8,
    /// Flags in the order they were raised
    pub flags: Vec<RiskFlag>,
    /// A challenge should be presented
    pub require_captcha: bool,
    /// Strong additional verification should be required
    pub require_additional_verification: bool,
    /// The score alone does not warrant denial
    pub allowed: bool,
}

impl RiskAssessment {
    /// Build an assessment from raised flags.
    ///
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn from_flags(flags: Vec<RiskFlag>, thresholds: &DecisionThresholds) -> Self {
        let mut ordered: Vec<RiskFlag> = Vec::with_capacity(flags.len());
        for flag in flags {
            if !ordered.contains(&flag) {
                ordered.push(flag);
            }
        }

        let score = RiskFlag::combine(&ordered);
        Self {
            score,
            flags: ordered,
            require_captcha: score >= thresholds.challenge,
            require_additional_verification: score >= thresholds.step_up,
            allowed: score < thresholds.deny,
        }
    }

    /// An assessment with no flags.
    pub fn clean(thresholds: &DecisionThresholds) -> Self {
        Self::from_flags(Vec::new(), thresholds)
    }

    /// Check whether a flag was raised.
    pub fn has_flag(&self, flag: RiskFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Flag wire names, for logging and API responses.
    pub fn flag_names(&self) -> Vec<&'static str> {
        self.flags.iter().map(RiskFlag::as_str).collect()
    }
}
