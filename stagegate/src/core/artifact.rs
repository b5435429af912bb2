//! Artifact keys and versioned artifact records.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Producer recorded for artifacts written when an instance is started.
pub const SEED_PRODUCER: &str = "$seed";

/// Producer recorded for artifacts supplied by an operator mid-run.
pub const OPERATOR_PRODUCER: &str = "$operator";

/// Storage keys starting with this character belong to the coordinator.
pub const RESERVED_KEY_PREFIX: char = '$';

/// Error returned when a textual artifact key cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid artifact key '{raw}': {reason}")]
pub struct ArtifactKeyError {
    /// The rejected input.
    pub raw: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// A namespaced logical artifact name such as `type:Plan` or `api:Endpoint`.
///
/// Keys serialize as their textual `<namespace>:<name>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey {
    namespace: String,
    name: String,
}

impl ArtifactKey {
    /// Creates a key from its parts.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is blank, or the namespace contains
    /// `:` or starts with the reserved `$` prefix.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, ArtifactKeyError> {
        let namespace = namespace.into();
        let name = name.into();
        let raw = format!("{namespace}:{name}");

        if namespace.trim().is_empty() {
            return Err(ArtifactKeyError { raw, reason: "namespace is empty" });
        }
        if namespace.contains(':') {
            return Err(ArtifactKeyError { raw, reason: "namespace contains ':'" });
        }
        if namespace.starts_with(RESERVED_KEY_PREFIX) {
            return Err(ArtifactKeyError { raw, reason: "namespace uses the reserved '$' prefix" });
        }
        if name.trim().is_empty() {
            return Err(ArtifactKeyError { raw, reason: "name is empty" });
        }

        Ok(Self { namespace, name })
    }

    /// Returns the namespace part (`type` in `type:Plan`).
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the logical name part (`Plan` in `type:Plan`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the textual form of this key starts with `prefix`.
    #[must_use]
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_string().starts_with(prefix)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for ArtifactKey {
    type Err = ArtifactKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Err(ArtifactKeyError {
                raw: s.to_string(),
                reason: "expected '<namespace>:<name>'",
            }),
        }
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = ArtifactKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.to_string()
    }
}

/// A typed, versioned payload stored in the type registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// The logical key.
    pub key: ArtifactKey,
    /// Schema the payload was validated against.
    pub schema_id: String,
    /// The payload itself.
    pub payload: serde_json::Value,
    /// Stage id (or reserved producer) that wrote this version.
    pub produced_by: String,
    /// When this version was committed.
    pub created_at: Timestamp,
    /// Monotonic version, starting at 1.
    pub version: u64,
    /// SHA-256 of the canonical payload encoding.
    pub digest: String,
}

impl Artifact {
    /// Returns true if `other` carries the same logical content (schema,
    /// producer and payload), ignoring version and timestamp.
    #[must_use]
    pub fn same_content(&self, schema_id: &str, produced_by: &str, digest: &str) -> bool {
        self.schema_id == schema_id && self.produced_by == produced_by && self.digest == digest
    }
}

/// Computes the hex SHA-256 digest of a payload's canonical JSON encoding.
///
/// Object keys are emitted in sorted order, so equal values hash equally.
#[must_use]
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key() {
        let key: ArtifactKey = "type:Plan".parse().unwrap();
        assert_eq!(key.namespace(), "type");
        assert_eq!(key.name(), "Plan");
        assert_eq!(key.to_string(), "type:Plan");
    }

    #[test]
    fn test_name_may_contain_colon() {
        let key: ArtifactKey = "api:GET:/users".parse().unwrap();
        assert_eq!(key.namespace(), "api");
        assert_eq!(key.name(), "GET:/users");
    }

    #[test]
    fn test_reject_malformed_keys() {
        assert!("Plan".parse::<ArtifactKey>().is_err());
        assert!(":Plan".parse::<ArtifactKey>().is_err());
        assert!("type:".parse::<ArtifactKey>().is_err());
        assert!("  :x".parse::<ArtifactKey>().is_err());
        assert!("$instance:x".parse::<ArtifactKey>().is_err());
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key: ArtifactKey = "type:Request".parse().unwrap();
        assert_eq!(serde_json::to_value(&key).unwrap(), json!("type:Request"));

        let back: ArtifactKey = serde_json::from_value(json!("type:Request")).unwrap();
        assert_eq!(back, key);

        let bad: Result<ArtifactKey, _> = serde_json::from_value(json!("nokey"));
        assert!(bad.is_err());
    }

    #[test]
    fn test_matches_prefix() {
        let key: ArtifactKey = "type:Plan".parse().unwrap();
        assert!(key.matches_prefix("type:"));
        assert!(key.matches_prefix(""));
        assert!(!key.matches_prefix("api:"));
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a = json!({"a": 1, "b": [1, 2]});
        let b = json!({"b": [1, 2], "a": 1});
        assert_eq!(payload_digest(&a), payload_digest(&b));
        assert_ne!(payload_digest(&a), payload_digest(&json!({"a": 2})));
        assert_eq!(payload_digest(&a).len(), 64);
    }
}
