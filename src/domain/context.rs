//! Per-request inputs to the engine.
//!
//! A [`RequestContext`] is created by the caller for every gated request and
//! dropped once the decision is made. Nothing in here is persisted.

use crate::domain::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Raw device and browser signals supplied by the client.
///
/// Only `user_agent` is mandatory. Everything else narrows the fingerprint
/// when present and is simply skipped when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSignals {
    /// The `User-Agent` header
    pub user_agent: String,
    /// The `Accept-Language` header
    #[serde(default)]
    pub accept_language: Option<String>,
    /// Reported IANA timezone, e.g. `Europe/Paris`
    #[serde(default)]
    pub timezone: Option<String>,
    /// Screen resolution as reported by the client, e.g. `1920x1080`
    #[serde(default)]
    pub screen: Option<String>,
    /// Platform string, e.g. `MacIntel`
    #[serde(default)]
    pub platform: Option<String>,
    /// Any further named components (canvas hash, font list digest, ...)
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl FingerprintSignals {
    /// Signals carrying only a user agent.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..Self::default()
        }
    }

    /// Set the accept-language component.
    pub fn with_accept_language(mut self, value: impl Into<String>) -> Self {
        self.accept_language = Some(value.into());
        self
    }

    /// Set the timezone component.
    pub fn with_timezone(mut self, value: impl Into<String>) -> Self {
        self.timezone = Some(value.into());
        self
    }

    /// Set the screen component.
    pub fn with_screen(mut self, value: impl Into<String>) -> Self {
        self.screen = Some(value.into());
        self
    }

    /// Set the platform component.
    pub fn with_platform(mut self, value: impl Into<String>) -> Self {
        self.platform = Some(value.into());
        self
    }

    /// Add a named extra component.
    pub fn with_component(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// Network attribution for the origin address, when the caller has it
/// (typically from a GeoIP/ASN database lookup done upstream).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Autonomous system number
    pub asn: Option<u32>,
    /// Autonomous system organisation name
    pub organization: Option<String>,
}

/// Everything the engine knows about one incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Name of the endpoint policy this request is gated by
    pub endpoint: String,
    /// Identity reference, usually an E.164 phone number
    pub identity: String,
    /// Client origin address
    pub origin: IpAddr,
    /// Device and browser signals
    pub signals: FingerprintSignals,
    /// When the request arrived
    pub timestamp: DateTime<Utc>,
    /// Session token presented by the client, if any
    pub session_token: Option<String>,
    /// ASN attribution of `origin`, if known
    pub network: Option<NetworkInfo>,
}

impl RequestContext {
    /// Create a context for `endpoint` with no session and no network info.
    pub fn new(
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        origin: IpAddr,
        signals: FingerprintSignals,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: identity.into(),
            origin,
            signals,
            timestamp,
            session_token: None,
            network: None,
        }
    }

    /// Attach the session token presented by the client.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Attach ASN attribution for the origin.
    pub fn with_network(mut self, network: NetworkInfo) -> Self {
        self.network = Some(network);
        self
    }
}

/// Counter identifier combining origin, device and identity.
///
/// This is the identifier recorded in violations and accepted by the admin
/// surface when clearing counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// Build the key for a request.
    pub fn new(origin: IpAddr, fingerprint: &Fingerprint, identity: &str) -> Self {
        CompositeKey(format!("{}|{}|{}", origin, fingerprint.short(), identity))
    }

    /// Wrap an identifier previously obtained from [`CompositeKey::as_str`].
    pub fn from_raw(raw: impl Into<String>) -> Self {
        CompositeKey(raw.into())
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counter key for this identifier under the given endpoint.
    pub fn counter_key(&self, endpoint: &str) -> String {
        format!("{}:{}", endpoint, self.0)
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
