//! Device fingerprint computation.
//!
//! A fingerprint identifies a client instance from its device and browser
//! signals. It is a SHA-256 digest over a canonical encoding of the signals:
//! - Fixed components (user agent, accept-language, timezone, screen, platform)
//! - Extra components, sorted by name
//!
//! Each component is encoded as `name`, `value` with length prefixes so that
//! no two distinct signal sets share an encoding. Absent components are
//! skipped, so adding one always changes the fingerprint.

use crate::domain::context::FingerprintSignals;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum length in bytes of a single component value.
pub const MAX_COMPONENT_LEN: usize = 1024;

/// Maximum number of extra components accepted.
pub const MAX_EXTRA_COMPONENTS: usize = 32;

/// Errors produced when signals cannot be fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// The user agent is empty or whitespace
    #[error("user agent is required")]
    MissingUserAgent,
    /// A component exceeds [`MAX_COMPONENT_LEN`]
    #[error("component `{name}` is {len} bytes, limit is {MAX_COMPONENT_LEN}")]
    ComponentTooLong {
        /// Component name
        name: String,
        /// Actual length in bytes
        len: usize,
    },
    /// A component contains control characters
    #[error("component `{name}` contains control characters")]
    InvalidCharacter {
        /// Component name
        name: String,
    },
    /// More than [`MAX_EXTRA_COMPONENTS`] extra components
    #[error("{0} extra components supplied, limit is {MAX_EXTRA_COMPONENTS}")]
    TooManyComponents(usize),
    /// A serialized fingerprint is not 64 lowercase hex characters
    #[error("fingerprint must be 64 lowercase hex characters")]
    InvalidDigest,
}

/// A device fingerprint: lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a fingerprint previously produced by [`FingerprintGenerator`].
    pub fn parse(raw: &str) -> Result<Self, FingerprintError> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Fingerprint(raw.to_string()))
        } else {
            Err(FingerprintError::InvalidDigest)
        }
    }

    /// The full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 16 hex digits, used in counter keys and logs.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fingerprint::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes fingerprints from signals.
///
/// Stateless; one instance can be shared freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintGenerator;

impl FingerprintGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self
    }

    /// Compute the fingerprint for `signals`.
    ///
    /// # Errors
    /// Returns a [`FingerprintError`] when the signals are malformed. No
    /// partial digest is ever produced.
    pub fn generate(&self, signals: &FingerprintSignals) -> Result<Fingerprint, FingerprintError> {
        if signals.user_agent.trim().is_empty() {
            return Err(FingerprintError::MissingUserAgent);
        }
        if signals.extra.len() > MAX_EXTRA_COMPONENTS {
            return Err(FingerprintError::TooManyComponents(signals.extra.len()));
        }

        let fixed = [
            ("user_agent", Some(signals.user_agent.as_str())),
            ("accept_language", signals.accept_language.as_deref()),
            ("timezone", signals.timezone.as_deref()),
            ("screen", signals.screen.as_deref()),
            ("platform", signals.platform.as_deref()),
        ];

        let mut hasher = Sha256::new();
        hasher.update(b"fp:v1");

        for (name, value) in fixed {
            if let Some(value) = value {
                validate_component(name, value)?;
                absorb(&mut hasher, b'f', name, value);
            }
        }

        // BTreeMap iteration is sorted, so insertion order never matters
        for (name, value) in &signals.extra {
            validate_component(name, name)?;
            validate_component(name, value)?;
            absorb(&mut hasher, b'x', name, value);
        }

        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }
}

fn validate_component(name: &str, value: &str) -> Result<(), FingerprintError> {
    if value.len() > MAX_COMPONENT_LEN {
        return Err(FingerprintError::ComponentTooLong {
            name: name.to_string(),
            len: value.len(),
        });
    }
    if value.chars().any(char::is_control) {
        return Err(FingerprintError::InvalidCharacter {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn absorb(hasher: &mut Sha256, tag: u8, name: &str, value: &str) {
    hasher.update([tag]);
    hasher.update((name.len() as u32).to_be_bytes());
    hasher.update(name.as_bytes());
    hasher.update((value.len() as u32).to_be_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chrome() -> FingerprintSignals {
        FingerprintSignals::new("Mozilla/5.0 (Macintosh) Chrome/126.0")
            .with_accept_language("fr-FR,fr;q=0.9")
            .with_timezone("Europe/Paris")
            .with_screen("1512x982")
            .with_platform("MacIntel")
    }

    #[test]
    fn test_identical_signals_produce_same_fingerprint() {
        let gen = FingerprintGenerator::new();
        assert_eq!(gen.generate(&chrome()).unwrap(), gen.generate(&chrome()).unwrap());
    }

    #[test]
    fn test_different_signals_produce_different_fingerprints() {
        let gen = FingerprintGenerator::new();
        let a = gen.generate(&chrome()).unwrap();
        let b = gen.generate(&chrome().with_screen("1920x1080")).unwrap();
        let c = gen.generate(&chrome().with_component("canvas", "9f2c")).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_component_boundaries_are_unambiguous() {
        let gen = FingerprintGenerator::new();
        let a = gen
            .generate(&FingerprintSignals::new("ua").with_component("ab", "c"))
            .unwrap();
        let b = gen
            .generate(&FingerprintSignals::new("ua").with_component("a", "bc"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_extra_component_order_independence() {
        let gen = FingerprintGenerator::new();
        let a = gen
            .generate(
                &FingerprintSignals::new("ua")
                    .with_component("z", "1")
                    .with_component("a", "2"),
            )
            .unwrap();
        let b = gen
            .generate(
                &FingerprintSignals::new("ua")
                    .with_component("a", "2")
                    .with_component("z", "1"),
            )
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_user_agent_rejected() {
        let gen = FingerprintGenerator::new();
        assert_eq!(
            gen.generate(&FingerprintSignals::new("   ")),
            Err(FingerprintError::MissingUserAgent)
        );
    }

    #[test]
    fn test_oversized_component_rejected() {
        let gen = FingerprintGenerator::new();
        let signals = FingerprintSignals::new("ua").with_screen("x".repeat(MAX_COMPONENT_LEN + 1));
        assert!(matches!(
            gen.generate(&signals),
            Err(FingerprintError::ComponentTooLong { ref name, .. }) if name == "screen"
        ));
    }

    #[test]
    fn test_control_characters_rejected() {
        let gen = FingerprintGenerator::new();
        let signals = FingerprintSignals::new("ua\nInjected: yes");
        assert!(matches!(
            gen.generate(&signals),
            Err(FingerprintError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn test_too_many_components_rejected() {
        let gen = FingerprintGenerator::new();
        let mut signals = FingerprintSignals::new("ua");
        for i in 0..=MAX_EXTRA_COMPONENTS {
            signals = signals.with_component(format!("c{}", i), "v");
        }
        assert_eq!(
            gen.generate(&signals),
            Err(FingerprintError::TooManyComponents(MAX_EXTRA_COMPONENTS + 1))
        );
    }

    #[test]
    fn test_parse_round_trip_and_rejects_garbage() {
        let fp = FingerprintGenerator::new().generate(&chrome()).unwrap();
        assert_eq!(Fingerprint::parse(fp.as_str()).unwrap(), fp);
        assert_eq!(fp.short().len(), 16);

        assert_eq!(Fingerprint::parse("abc"), Err(FingerprintError::InvalidDigest));
        assert_eq!(
            Fingerprint::parse(&"G".repeat(64)),
            Err(FingerprintError::InvalidDigest)
        );
        assert_eq!(
            Fingerprint::parse(&fp.as_str().to_uppercase()),
            Err(FingerprintError::InvalidDigest)
        );
    }
}
