//! In-process backend.

use super::{KvBackend, VersionedRecord};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

type Namespace = BTreeMap<String, VersionedRecord>;

/// [`KvBackend`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<BTreeMap<String, Namespace>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self
            .data
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: u64,
        value: Value,
    ) -> Result<u64, StoreError> {
        let mut data = self.data.write();
        let ns = data.entry(namespace.to_string()).or_default();
        let actual = ns.get(key).map_or(0, |r| r.version);

        if actual != expected {
            return Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let version = actual + 1;
        ns.insert(key.to_string(), VersionedRecord { version, value });
        Ok(version)
    }

    async fn scan_page(
        &self,
        namespace: &str,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, VersionedRecord)>, StoreError> {
        let data = self.data.read();
        let Some(ns) = data.get(namespace) else {
            return Ok(Vec::new());
        };

        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };

        Ok(ns
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .read()
            .iter()
            .filter(|(_, ns)| !ns.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}
