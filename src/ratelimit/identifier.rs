//! Request identifiers and counter key derivation.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::rules::{Dimension, Rule};
use crate::error::Result;

/// The identifiers resolved for one request, keyed by dimension.
///
/// Empty values are treated as absent, so rules on that dimension are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierBundle {
    values: HashMap<Dimension, String>,
}

impl IdentifierBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, dimension: Dimension, value: impl Into<String>) -> Self {
        self.insert(dimension, value);
        self
    }

    pub fn insert(&mut self, dimension: Dimension, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&dimension);
        } else {
            self.values.insert(dimension, value);
        }
    }

    /// Build a bundle from dimension names as they arrive on the wire.
    pub fn from_named<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut bundle = Self::new();
        for (name, value) in pairs {
            bundle.insert(name.as_ref().parse()?, value);
        }
        Ok(bundle)
    }

    pub fn get(&self, dimension: Dimension) -> Option<&str> {
        self.values.get(&dimension).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A store key uniquely identifying one (rule, identifier) counter.
///
/// The key is `prefix:algorithm:dimension:rule:digest` where `digest` is the
/// hex SHA-256 of the identifier value, which bounds key length and keeps raw
/// identifiers out of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// Derive the key for `rule` and an identifier value. Pure and deterministic.
    pub fn derive(prefix: &str, rule: &Rule, value: &str) -> Self {
        let digest = hex::encode(Sha256::digest(value.as_bytes()));
        Self(format!(
            "{}:{}:{}:{}:{}",
            prefix,
            rule.algorithm().name(),
            rule.dimension(),
            rule.id(),
            digest
        ))
    }

    /// The key of one numbered window under this key.
    pub fn windowed(&self, window_index: u64) -> String {
        format!("{}:{}", self.0, window_index)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodgateError;
    use crate::ratelimit::rules::RuleSet;
    use std::time::Duration;

    fn rule(name: &str, dimension: Dimension) -> Rule {
        Rule::fixed_window(name, dimension, 10, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_bundle_from_named() {
        let bundle = IdentifierBundle::from_named([
            ("network_address", "203.0.113.4"),
            ("account", "acct_123"),
        ])
        .unwrap();

        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get(Dimension::NetworkAddress), Some("203.0.113.4"));
        assert_eq!(bundle.get(Dimension::Account), Some("acct_123"));
        assert_eq!(bundle.get(Dimension::Credential), None);
    }

    #[test]
    fn test_bundle_rejects_unknown_dimension() {
        let result = IdentifierBundle::from_named([("ip", "203.0.113.4")]);
        assert!(matches!(result, Err(FloodgateError::UnknownDimension(name)) if name == "ip"));
    }

    #[test]
    fn test_empty_value_is_absent() {
        let bundle = IdentifierBundle::new()
            .with(Dimension::Account, "acct_1")
            .with(Dimension::Account, "");
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_key_layout_hides_identifier() {
        let key = CounterKey::derive("floodgate", &rule("per-account", Dimension::Account), "acct_123");

        assert!(key.as_str().starts_with("floodgate:fixed_window:account:per-account:"));
        assert!(!key.as_str().contains("acct_123"));
        // sha256 hex digest
        assert_eq!(key.as_str().rsplit(':').next().unwrap().len(), 64);
        assert_eq!(key.windowed(7), format!("{}:7", key));
    }

    #[test]
    fn test_key_derivation_is_stable_across_loads() {
        let yaml = r#"
rules:
  - { name: a, dimension: account, limit: 5, window: 1s }
  - { dimension: network_address, limit: 9, window: 1m }
"#;
        let first = RuleSet::from_yaml(yaml).unwrap();
        let second = RuleSet::from_yaml(yaml).unwrap();

        for (left, right) in first.iter().zip(second.iter()) {
            assert_eq!(
                CounterKey::derive("p", left, "value"),
                CounterKey::derive("p", right, "value")
            );
        }
    }

    #[test]
    fn test_keys_are_disjoint_per_rule_and_value() {
        let a = rule("a", Dimension::Account);
        let b = rule("b", Dimension::Account);

        assert_ne!(CounterKey::derive("p", &a, "x"), CounterKey::derive("p", &b, "x"));
        assert_ne!(CounterKey::derive("p", &a, "x"), CounterKey::derive("p", &a, "y"));
    }
}
