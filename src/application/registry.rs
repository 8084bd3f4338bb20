//! Registry of endpoint policies.
//!
//! Holds the policy for every gated endpoint. Reads happen on every request;
//! updates come from the admin surface and replace a policy atomically.

use crate::domain::policy::{EndpointPolicy, PolicyError, PolicyUpdate};
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent map of endpoint name to policy.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: Arc<DashMap<String, EndpointPolicy>>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding [`EndpointPolicy::defaults`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for policy in EndpointPolicy::defaults() {
            registry.policies.insert(policy.name.clone(), policy);
        }
        registry
    }

    /// Add or replace a policy after validating it.
    pub fn insert(&self, policy: EndpointPolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Get a copy of the policy for `endpoint`.
    pub fn get(&self, endpoint: &str) -> Option<EndpointPolicy> {
        self.policies.get(endpoint).map(|entry| entry.value().clone())
    }

    /// Apply a partial update to an existing policy.
    ///
    /// Returns `Ok(None)` if the endpoint is unknown. A rejected update leaves
    /// the stored policy untouched.
    pub fn update(
        &self,
        endpoint: &str,
        update: &PolicyUpdate,
    ) -> Result<Option<EndpointPolicy>, PolicyError> {
        let Some(mut entry) = self.policies.get_mut(endpoint) else {
            return Ok(None);
        };
        let next = entry.apply(update)?;
        *entry = next.clone();
        Ok(Some(next))
    }

    /// All policies, sorted by name.
    pub fn all(&self) -> Vec<EndpointPolicy> {
        let mut policies: Vec<EndpointPolicy> = self
            .policies
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    /// Endpoint names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Get the number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::EndpointClass;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_defaults_loaded() {
        let registry = PolicyRegistry::with_defaults();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.get("auth").unwrap().max_requests, 5);
        assert!(registry.get("unknown").is_none());
        assert_eq!(
            registry.names(),
            vec!["admin", "auth", "code-delivery", "code-verification", "read", "write"]
        );
    }

    #[test]
    fn test_insert_validates() {
        let registry = PolicyRegistry::new();
        assert!(registry.is_empty());

        let mut bad = EndpointPolicy::new(
            "export",
            EndpointClass::Read,
            Duration::from_secs(60),
            10,
        )
        .unwrap();
        bad.max_requests = 0;
        assert!(registry.insert(bad).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update() {
        let registry = PolicyRegistry::with_defaults();
        let updated = registry
            .update(
                "code-delivery",
                &PolicyUpdate {
                    max_requests: Some(10),
                    ..PolicyUpdate::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.max_requests, 10);
        assert_eq!(registry.get("code-delivery").unwrap().max_requests, 10);

        assert!(registry
            .update("code-delivery", &PolicyUpdate {
                window_ms: Some(0),
                ..PolicyUpdate::default()
            })
            .is_err());
        assert_eq!(registry.get("code-delivery").unwrap().window_ms, 3_600_000);

        assert_eq!(
            registry.update("missing", &PolicyUpdate::default()).unwrap(),
            None
        );
    }

    #[test]
    fn test_concurrent_reads_and_updates() {
        let registry = PolicyRegistry::with_defaults();
        let handles: Vec<_> = (1..=8u64)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        registry
                            .update("write", &PolicyUpdate {
                                max_requests: Some(i),
                                ..PolicyUpdate::default()
                            })
                            .unwrap();
                        assert!(registry.get("write").is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let max = registry.get("write").unwrap().max_requests;
        assert!((1..=8).contains(&max));
    }
}
