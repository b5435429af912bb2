//! Durable key-value storage abstraction with compare-and-set.
//!
//! The registry and the instance store persist everything through a
//! [`KvBackend`]. Records are addressed by `(namespace, key)` and carry a
//! monotonically increasing version; version `0` means "absent".

mod memory;

pub use memory::InMemoryBackend;

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored value together with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Version of this record, starting at 1.
    pub version: u64,
    /// Stored value.
    pub value: Value,
}

/// Storage backend used by the registry and the coordinator.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Reads the latest record for a key.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Writes `value` if the stored version equals `expected` (0 for absent).
    ///
    /// Returns the new version on success and [`StoreError::Conflict`] when
    /// another writer got there first.
    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: u64,
        value: Value,
    ) -> Result<u64, StoreError>;

    /// Returns up to `limit` records whose key starts with `prefix`, in key
    /// order, strictly after `after` when given.
    async fn scan_page(
        &self,
        namespace: &str,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, VersionedRecord)>, StoreError>;

    /// Lists every namespace holding at least one record.
    async fn namespaces(&self) -> Result<Vec<String>, StoreError>;
}
