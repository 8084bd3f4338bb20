//! Risk scoring.
//!
//! The scorer evaluates three independent families of signals and raises
//! [`RiskFlag`]s in a fixed order:
//! 1. Network reputation of the origin
//! 2. Trust in the identity reference
//! 3. Behavioral anomalies in recent history
//!
//! Flags are combined by [`RiskAssessment::from_flags`].

use crate::application::history::BehaviorHistory;
use crate::domain::context::RequestContext;
use crate::domain::risk::{DecisionThresholds, RiskAssessment, RiskFlag, ThresholdError};
use crate::domain::{identity, network};
use chrono::Timelike;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Errors in risk configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RiskConfigError {
    /// A behavior window is zero
    #[error("behavior window `{0}` must be greater than 0")]
    ZeroWindow(&'static str),
    /// Unusual hours outside 0..=24 or empty
    #[error("unusual hours must satisfy start < end <= 24, got {start}..{end}")]
    InvalidHours {
        /// First unusual hour
        start: u32,
        /// First hour after the unusual range
        end: u32,
    },
    /// Decision thresholds are invalid
    #[error(transparent)]
    Thresholds(#[from] ThresholdError),
}

/// Windows over which behavioral rules count attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorWindows {
    /// Distinct origins per identity
    pub origins: Duration,
    /// Distinct devices per identity
    pub devices: Duration,
    /// Identities and attempts per source
    pub source: Duration,
    /// Verification failures per identity
    pub failures: Duration,
    /// Unusual-hour attempts per identity
    pub unusual_hours: Duration,
}

impl Default for BehaviorWindows {
    fn default() -> Self {
        Self {
            origins: Duration::from_secs(10 * 60),
            devices: Duration::from_secs(5 * 60),
            source: Duration::from_secs(10 * 60),
            failures: Duration::from_secs(10 * 60),
            unusual_hours: Duration::from_secs(10 * 60),
        }
    }
}

/// Limits over which behavioral flags are raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorLimits {
    /// Raise `MULTIPLE_IPS_SHORT_TIME` above this many origins
    pub max_origins: usize,
    /// Raise `MULTIPLE_DEVICES_SHORT_TIME` above this many devices
    pub max_devices: usize,
    /// Raise `PHONE_ENUMERATION` above this many identities per source
    pub max_identities_per_source: usize,
    /// Raise `HIGH_REQUEST_VELOCITY` above this many attempts per source
    pub max_source_attempts: usize,
    /// Raise `REPEATED_VERIFICATION_FAILURES` at this many failures
    pub failure_threshold: usize,
    /// Raise `UNUSUAL_HOUR_ACTIVITY` above this many unusual-hour attempts
    pub unusual_hour_threshold: usize,
}

impl Default for BehaviorLimits {
    fn default() -> Self {
        Self {
            max_origins: 3,
            max_devices: 2,
            max_identities_per_source: 5,
            max_source_attempts: 5,
            failure_threshold: 3,
            unusual_hour_threshold: 3,
        }
    }
}

/// Scorer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Proxy and VPN ranges
    pub proxy_ranges: Vec<IpNet>,
    /// ASNs of hosting providers
    pub hosting_asns: Vec<u32>,
    /// Lowercase organisation name fragments of hosting providers
    pub hosting_patterns: Vec<String>,
    /// Prefixes of virtual-number ranges
    pub virtual_prefixes: Vec<String>,
    /// First unusual hour, UTC
    pub unusual_hours_start: u32,
    /// First hour after the unusual range, UTC
    pub unusual_hours_end: u32,
    /// Behavior windows
    pub windows: BehaviorWindows,
    /// Behavior limits
    pub limits: BehaviorLimits,
    /// Decision thresholds
    pub thresholds: DecisionThresholds,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            proxy_ranges: Vec::new(),
            hosting_asns: network::DEFAULT_HOSTING_ASNS.to_vec(),
            hosting_patterns: network::DEFAULT_HOSTING_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            virtual_prefixes: identity::DEFAULT_VIRTUAL_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            unusual_hours_start: 1,
            unusual_hours_end: 5,
            windows: BehaviorWindows::default(),
            limits: BehaviorLimits::default(),
            thresholds: DecisionThresholds::default(),
        }
    }
}

impl RiskConfig {
    /// Check every range invariant.
    pub fn validate(&self) -> Result<(), RiskConfigError> {
        self.thresholds.validate()?;
        for (name, window) in [
            ("origins", self.windows.origins),
            ("devices", self.windows.devices),
            ("source", self.windows.source),
            ("failures", self.windows.failures),
            ("unusual_hours", self.windows.unusual_hours),
        ] {
            if window.is_zero() {
                return Err(RiskConfigError::ZeroWindow(name));
            }
        }
        if self.unusual_hours_start >= self.unusual_hours_end || self.unusual_hours_end > 24 {
            return Err(RiskConfigError::InvalidHours {
                start: self.unusual_hours_start,
                end: self.unusual_hours_end,
            });
        }
        Ok(())
    }

    /// Longest behavior window; history older than this is never consulted.
    pub fn history_retention(&self) -> Duration {
        [
            self.windows.origins,
            self.windows.devices,
            self.windows.source,
            self.windows.failures,
            self.windows.unusual_hours,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }

    fn is_unusual_hour(&self, hour: u32) -> bool {
        (self.unusual_hours_start..self.unusual_hours_end).contains(&hour)
    }
}

/// Combines network, identity and behavior signals into a risk assessment.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    /// Create a scorer with validated configuration.
    pub fn new(config: RiskConfig) -> Result<Self, RiskConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The scorer's configuration.
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Score one request.
    ///
    /// `history` must already contain the request being scored.
    pub fn score(
        &self,
        ctx: &RequestContext,
        history: &BehaviorHistory,
    ) -> RiskAssessment {
        let mut flags = Vec::new();
        self.network_flags(ctx, &mut flags);
        self.identity_flags(&ctx.identity, &mut flags);
        self.behavior_flags(ctx, history, &mut flags);

        let assessment = RiskAssessment::from_flags(flags, &self.config.thresholds);
        if !assessment.flags.is_empty() {
            tracing::debug!(
                endpoint = %ctx.endpoint,
                score = assessment.score,
                flags = ?assessment.flag_names(),
                "Risk flags raised"
            );
        }
        assessment
    }

    fn network_flags(&self, ctx: &RequestContext, flags: &mut Vec<RiskFlag>) {
        if network::is_private_or_reserved(ctx.origin) {
            flags.push(RiskFlag::PrivateOrReservedIp);
        }
        if network::in_ranges(ctx.origin, &self.config.proxy_ranges) {
            flags.push(RiskFlag::KnownProxyRange);
        }
        if let Some(info) = &ctx.network {
            if network::is_datacenter(info, &self.config.hosting_asns, &self.config.hosting_patterns) {
                flags.push(RiskFlag::DatacenterNetwork);
            }
        }
    }

    fn identity_flags(&self, raw: &str, flags: &mut Vec<RiskFlag>) {
        if !identity::is_e164(raw) {
            flags.push(RiskFlag::MalformedPhone);
            return;
        }
        if identity::has_virtual_prefix(raw, &self.config.virtual_prefixes) {
            flags.push(RiskFlag::VirtualNumber);
        }
        if identity::is_disposable_pattern(raw) {
            flags.push(RiskFlag::DisposableNumber);
        }
    }

    fn behavior_flags(
        &self,
        ctx: &RequestContext,
        history: &BehaviorHistory,
        flags: &mut Vec<RiskFlag>,
    ) {
        let now = ctx.timestamp;
        let windows = &self.config.windows;
        let limits = &self.config.limits;

        let origins: HashSet<_> = history
            .identity_within(now, windows.origins)
            .map(|a| a.origin)
            .collect();
        if origins.len() > limits.max_origins {
            flags.push(RiskFlag::MultipleIpsShortTime);
        }

        let devices: HashSet<_> = history
            .identity_within(now, windows.devices)
            .map(|a| a.fingerprint.as_str())
            .collect();
        if devices.len() > limits.max_devices {
            flags.push(RiskFlag::MultipleDevicesShortTime);
        }

        let unusual = history
            .identity_within(now, windows.unusual_hours)
            .filter(|a| self.config.is_unusual_hour(a.at.hour()))
            .count();
        if unusual > limits.unusual_hour_threshold {
            flags.push(RiskFlag::UnusualHourActivity);
        }

        let identities: HashSet<_> = history
            .source_within(now, windows.source)
            .map(|a| a.identity.as_str())
            .collect();
        if identities.len() > limits.max_identities_per_source {
            flags.push(RiskFlag::PhoneEnumeration);
        }

        if history.source_within(now, windows.source).count() > limits.max_source_attempts {
            flags.push(RiskFlag::HighRequestVelocity);
        }

        if history.failures_within(now, windows.failures) >= limits.failure_threshold {
            flags.push(RiskFlag::RepeatedVerificationFailures);
        }
    }
}
