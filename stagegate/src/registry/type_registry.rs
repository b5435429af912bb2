//! Versioned, namespaced artifact storage.

use crate::contracts::{ArtifactValidator, SchemaRegistry};
use crate::core::{payload_digest, Artifact, ArtifactKey, RESERVED_KEY_PREFIX};
use crate::errors::{RegistryError, StoreError, ValidationError};
use crate::store::{KvBackend, VersionedRecord};
use crate::utils::now_utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of the change notification channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default number of records fetched per scan page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 64;

/// Notification emitted for every committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactChange {
    /// Namespace the artifact lives in.
    pub namespace: String,
    /// The artifact key.
    pub key: ArtifactKey,
    /// The committed version.
    pub version: u64,
    /// Who wrote it.
    pub produced_by: String,
}

/// Stores typed artifacts with per-key versions and compare-and-set writes.
///
/// Every payload is validated against its schema before it is committed,
/// so anything readable from the registry re-validates.
pub struct TypeRegistry {
    backend: Arc<dyn KvBackend>,
    validator: ArtifactValidator,
    changes: broadcast::Sender<ArtifactChange>,
    scan_page_size: usize,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("schemas", &self.validator.schemas().len())
            .field("subscribers", &self.changes.receiver_count())
            .field("scan_page_size", &self.scan_page_size)
            .finish_non_exhaustive()
    }
}

impl TypeRegistry {
    /// Creates a registry over a storage backend and a schema registry.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, schemas: Arc<SchemaRegistry>) -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            backend,
            validator: ArtifactValidator::new(schemas),
            changes,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    /// Sets the capacity of the change notification channel.
    ///
    /// Existing subscribers keep listening on the old channel, so call this
    /// before handing out receivers.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        self.changes = changes;
        self
    }

    /// Sets how many records a scan fetches per page.
    #[must_use]
    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size.max(1);
        self
    }

    /// The schema registry payloads are validated against.
    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        self.validator.schemas()
    }

    /// The payload validator.
    #[must_use]
    pub fn validator(&self) -> &ArtifactValidator {
        &self.validator
    }

    /// Validates and stores a payload, returning the committed version.
    ///
    /// `expected_version` is the version the writer believes is current
    /// (0 if the key should be absent). Writing content identical to the
    /// latest version (same schema, producer and payload) returns that
    /// version without creating a new one.
    pub async fn put(
        &self,
        namespace: &str,
        key: &ArtifactKey,
        schema_id: &str,
        payload: Value,
        produced_by: &str,
        expected_version: u64,
    ) -> Result<u64, RegistryError> {
        // Freeze the definition first so it cannot change between validation and commit.
        self.schemas().mark_referenced(schema_id);
        self.validator
            .validate(schema_id, &payload)
            .map_err(|e| match e {
                ValidationError::UnknownSchema(id) if id == schema_id => RegistryError::UnknownSchema(id),
                other => RegistryError::SchemaMismatch {
                    key: key.clone(),
                    schema_id: schema_id.to_string(),
                    source: other,
                },
            })?;

        let digest = payload_digest(&payload);
        let storage_key = key.to_string();

        let current = self.load(namespace, &storage_key).await?;
        let actual = current.as_ref().map_or(0, |a| a.version);

        if let Some(existing) = &current {
            if existing.same_content(schema_id, produced_by, &digest) {
                debug!(namespace, key = %key, version = actual, "Idempotent artifact replay");
                return Ok(actual);
            }
        }

        if actual != expected_version {
            return Err(RegistryError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }

        let artifact = Artifact {
            key: key.clone(),
            schema_id: schema_id.to_string(),
            payload,
            produced_by: produced_by.to_string(),
            created_at: now_utc(),
            version: expected_version + 1,
            digest,
        };
        let value = serde_json::to_value(&artifact).map_err(|e| RegistryError::Corrupt {
            key: storage_key.clone(),
            reason: e.to_string(),
        })?;

        let version = self
            .backend
            .compare_and_set(namespace, &storage_key, expected_version, value)
            .await
            .map_err(|e| match e {
                StoreError::Conflict { expected, actual, .. } => RegistryError::VersionConflict {
                    key: key.clone(),
                    expected,
                    actual,
                },
                other => RegistryError::Store(other),
            })?;

        debug!(namespace, key = %key, version, produced_by, "Artifact committed");

        // No receivers is fine.
        let _ = self.changes.send(ArtifactChange {
            namespace: namespace.to_string(),
            key: key.clone(),
            version,
            produced_by: produced_by.to_string(),
        });

        Ok(version)
    }

    /// Returns the latest version of an artifact.
    pub async fn get(&self, namespace: &str, key: &ArtifactKey) -> Result<Artifact, RegistryError> {
        self.load(namespace, &key.to_string())
            .await?
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })
    }

    /// Returns the latest version number of a key, 0 when absent.
    pub async fn current_version(&self, namespace: &str, key: &ArtifactKey) -> Result<u64, RegistryError> {
        Ok(self
            .backend
            .get(namespace, &key.to_string())
            .await?
            .map_or(0, |r| r.version))
    }

    /// Lazily enumerates artifacts whose textual key starts with `prefix`,
    /// in key order.
    ///
    /// Pages are fetched on demand. Each call starts a fresh enumeration of
    /// the current state; writes made while a scan is in progress may or may
    /// not be observed.
    pub fn scan(&self, namespace: &str, prefix: &str) -> BoxStream<'static, Result<Artifact, RegistryError>> {
        let cursor = ScanCursor {
            backend: Arc::clone(&self.backend),
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            after: None,
            buffer: VecDeque::new(),
            page_size: self.scan_page_size,
            exhausted: false,
        };

        stream::try_unfold(cursor, ScanCursor::next_artifact).boxed()
    }

    /// Collects a full scan into a vector.
    pub async fn scan_collect(&self, namespace: &str, prefix: &str) -> Result<Vec<Artifact>, RegistryError> {
        self.scan(namespace, prefix).try_collect().await
    }

    /// Subscribes to change notifications for every subsequent write.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ArtifactChange> {
        self.changes.subscribe()
    }

    async fn load(&self, namespace: &str, storage_key: &str) -> Result<Option<Artifact>, RegistryError> {
        match self.backend.get(namespace, storage_key).await? {
            Some(record) => decode(storage_key, record).map(Some),
            None => Ok(None),
        }
    }
}

struct ScanCursor {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    prefix: String,
    after: Option<String>,
    buffer: VecDeque<(String, VersionedRecord)>,
    page_size: usize,
    exhausted: bool,
}

impl ScanCursor {
    async fn next_artifact(mut self) -> Result<Option<(Artifact, Self)>, RegistryError> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self
                .backend
                .scan_page(&self.namespace, &self.prefix, self.after.as_deref(), self.page_size)
                .await?;
            self.exhausted = page.len() < self.page_size;
            self.after = page.last().map(|(k, _)| k.clone());
            self.buffer
                .extend(page.into_iter().filter(|(k, _)| !k.starts_with(RESERVED_KEY_PREFIX)));
        }

        match self.buffer.pop_front() {
            Some((key, record)) => {
                let artifact = decode(&key, record)?;
                Ok(Some((artifact, self)))
            }
            None => Ok(None),
        }
    }
}

fn decode(storage_key: &str, record: VersionedRecord) -> Result<Artifact, RegistryError> {
    let mut artifact: Artifact = serde_json::from_value(record.value).map_err(|e| RegistryError::Corrupt {
        key: storage_key.to_string(),
        reason: e.to_string(),
    })?;
    artifact.version = record.version;
    Ok(artifact)
}
