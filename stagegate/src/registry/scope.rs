//! Per-invocation access scope over the type registry.

use super::retry::{with_conflict_retry, ConflictRetryPolicy, RetryError};
use super::type_registry::TypeRegistry;
use crate::core::{Artifact, ArtifactKey};
use crate::errors::{AccessKind, RegistryError};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// An out-of-scope access attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeViolationRecord {
    /// The key that was touched.
    pub key: ArtifactKey,
    /// Read or write.
    pub access: AccessKind,
}

/// A write the validator refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedWrite {
    /// The key that was written.
    pub key: ArtifactKey,
    /// The validation message.
    pub reason: String,
}

#[derive(Debug, Default)]
struct ScopeLog {
    violations: Vec<ScopeViolationRecord>,
    written: BTreeMap<ArtifactKey, u64>,
    rejected: Vec<RejectedWrite>,
    conflict_exhausted: Option<ArtifactKey>,
}

/// Registry handle restricted to one stage's declared read and write sets.
///
/// Cloning the handle shares the underlying access log. The coordinator
/// inspects the log after the adapter returns.
#[derive(Debug, Clone)]
pub struct ScopedRegistry {
    registry: Arc<TypeRegistry>,
    namespace: String,
    stage: String,
    reads: Arc<BTreeSet<ArtifactKey>>,
    writes: Arc<BTreeMap<ArtifactKey, String>>,
    retry: ConflictRetryPolicy,
    log: Arc<Mutex<ScopeLog>>,
    revoked: Arc<AtomicBool>,
}

impl ScopedRegistry {
    /// Creates a scope for `stage` in `namespace`.
    ///
    /// `writes` maps each writable key to the schema id it must be stored
    /// under.
    #[must_use]
    pub fn new(
        registry: Arc<TypeRegistry>,
        namespace: impl Into<String>,
        stage: impl Into<String>,
        reads: impl IntoIterator<Item = ArtifactKey>,
        writes: impl IntoIterator<Item = (ArtifactKey, String)>,
    ) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
            stage: stage.into(),
            reads: Arc::new(reads.into_iter().collect()),
            writes: Arc::new(writes.into_iter().collect()),
            retry: ConflictRetryPolicy::default(),
            log: Arc::new(Mutex::new(ScopeLog::default())),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the conflict retry policy used by [`put`](Self::put).
    #[must_use]
    pub fn with_retry_policy(mut self, policy: ConflictRetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Stage owning this scope.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Namespace of the workflow instance.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Keys the stage may read, excluding its own outputs.
    #[must_use]
    pub fn read_keys(&self) -> &BTreeSet<ArtifactKey> {
        &self.reads
    }

    /// Keys the stage may write and their schema ids.
    #[must_use]
    pub fn write_keys(&self) -> &BTreeMap<ArtifactKey, String> {
        &self.writes
    }

    /// Returns true if the stage may read `key`.
    #[must_use]
    pub fn can_read(&self, key: &ArtifactKey) -> bool {
        self.reads.contains(key) || self.writes.contains_key(key)
    }

    /// Returns true if the stage may write `key`.
    #[must_use]
    pub fn can_write(&self, key: &ArtifactKey) -> bool {
        self.writes.contains_key(key)
    }

    /// Reads the latest version of an in-scope artifact.
    pub async fn get(&self, key: &ArtifactKey) -> Result<Artifact, RegistryError> {
        self.check(key, AccessKind::Read)?;
        self.registry.get(&self.namespace, key).await
    }

    /// Like [`get`](Self::get), but maps a missing artifact to `None`.
    pub async fn get_optional(&self, key: &ArtifactKey) -> Result<Option<Artifact>, RegistryError> {
        match self.get(key).await {
            Ok(artifact) => Ok(Some(artifact)),
            Err(RegistryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Version of an in-scope key, 0 when absent.
    pub async fn current_version(&self, key: &ArtifactKey) -> Result<u64, RegistryError> {
        self.check(key, AccessKind::Read)?;
        self.registry.current_version(&self.namespace, key).await
    }

    /// Scans in-scope artifacts whose key starts with `prefix`.
    ///
    /// Out-of-scope keys are skipped silently.
    pub fn scan(&self, prefix: &str) -> BoxStream<'static, Result<Artifact, RegistryError>> {
        let reads = Arc::clone(&self.reads);
        let writes = Arc::clone(&self.writes);
        self.registry
            .scan(&self.namespace, prefix)
            .try_filter(move |a| {
                let visible = reads.contains(&a.key) || writes.contains_key(&a.key);
                futures::future::ready(visible)
            })
            .boxed()
    }

    /// Writes a payload under its declared schema, retrying version
    /// conflicts by re-reading the current version.
    ///
    /// Returns the committed version.
    pub async fn put(&self, key: &ArtifactKey, payload: Value) -> Result<u64, RegistryError> {
        let schema_id = self.check_write(key)?;

        let result = with_conflict_retry(&self.retry, &key.to_string(), RegistryError::is_conflict, |_| {
            let payload = payload.clone();
            let schema_id = schema_id.clone();
            async move {
                let expected = self.registry.current_version(&self.namespace, key).await?;
                self.registry
                    .put(&self.namespace, key, &schema_id, payload, &self.stage, expected)
                    .await
            }
        })
        .await;

        match result {
            Ok(version) => {
                self.record_write(key, version);
                Ok(version)
            }
            Err(RetryError::Exhausted { last, .. }) => {
                warn!(stage = %self.stage, key = %key, "Write abandoned after repeated version conflicts");
                let mut log = self.log.lock();
                if log.conflict_exhausted.is_none() {
                    log.conflict_exhausted = Some(key.clone());
                }
                drop(log);
                Err(last)
            }
            Err(RetryError::Fatal(e)) => Err(self.record_failure(key, e)),
        }
    }

    /// Writes a payload only if the stored version equals `expected`.
    ///
    /// Conflicts are returned to the caller without retry.
    pub async fn put_expecting(&self, key: &ArtifactKey, payload: Value, expected: u64) -> Result<u64, RegistryError> {
        let schema_id = self.check_write(key)?;
        match self
            .registry
            .put(&self.namespace, key, &schema_id, payload, &self.stage, expected)
            .await
        {
            Ok(version) => {
                self.record_write(key, version);
                Ok(version)
            }
            Err(e) => Err(self.record_failure(key, e)),
        }
    }

    /// Out-of-scope accesses recorded so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ScopeViolationRecord> {
        self.log.lock().violations.clone()
    }

    /// Keys written through this scope and their latest committed version.
    #[must_use]
    pub fn written(&self) -> BTreeMap<ArtifactKey, u64> {
        self.log.lock().written.clone()
    }

    /// Returns true if `key` was written through this scope.
    #[must_use]
    pub fn has_written(&self, key: &ArtifactKey) -> bool {
        self.log.lock().written.contains_key(key)
    }

    /// Writes the validator refused.
    #[must_use]
    pub fn rejected_writes(&self) -> Vec<RejectedWrite> {
        self.log.lock().rejected.clone()
    }

    /// First key whose write gave up after repeated conflicts.
    #[must_use]
    pub fn conflict_exhausted(&self) -> Option<ArtifactKey> {
        self.log.lock().conflict_exhausted.clone()
    }

    /// Disables the scope. Later accesses fail and are not recorded.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Returns true once the scope has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    fn check(&self, key: &ArtifactKey, access: AccessKind) -> Result<(), RegistryError> {
        let allowed = match access {
            AccessKind::Read => self.can_read(key),
            AccessKind::Write => self.can_write(key),
        };
        if allowed && !self.is_revoked() {
            return Ok(());
        }

        if !self.is_revoked() {
            warn!(stage = %self.stage, key = %key, %access, "Out-of-scope registry access");
            self.log.lock().violations.push(ScopeViolationRecord {
                key: key.clone(),
                access,
            });
        }
        Err(RegistryError::ScopeViolation {
            stage: self.stage.clone(),
            key: key.clone(),
            access,
        })
    }

    fn check_write(&self, key: &ArtifactKey) -> Result<String, RegistryError> {
        self.check(key, AccessKind::Write)?;
        self.writes
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::ScopeViolation {
                stage: self.stage.clone(),
                key: key.clone(),
                access: AccessKind::Write,
            })
    }

    fn record_write(&self, key: &ArtifactKey, version: u64) {
        if !self.is_revoked() {
            self.log.lock().written.insert(key.clone(), version);
        }
    }

    fn record_failure(&self, key: &ArtifactKey, error: RegistryError) -> RegistryError {
        if matches!(error, RegistryError::SchemaMismatch { .. } | RegistryError::UnknownSchema(_)) {
            self.log.lock().rejected.push(RejectedWrite {
                key: key.clone(),
                reason: error.to_string(),
            });
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{FieldSpec, FieldType, Schema, SchemaRegistry};
    use crate::registry::JitterStrategy;
    use crate::store::InMemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const NS: &str = "wf/scope";

    fn key(s: &str) -> ArtifactKey {
        s.parse().unwrap()
    }

    fn registry() -> Arc<TypeRegistry> {
        let schemas = Arc::new(SchemaRegistry::new());
        schemas
            .register(Schema::new("Doc").field("body", FieldSpec::required(FieldType::String)))
            .unwrap();
        Arc::new(TypeRegistry::new(Arc::new(InMemoryBackend::new()), schemas))
    }

    fn scope(registry: &Arc<TypeRegistry>) -> ScopedRegistry {
        ScopedRegistry::new(
            Arc::clone(registry),
            NS,
            "writer",
            [key("type:Input")],
            [(key("type:Output"), "Doc".to_string())],
        )
    }

    #[tokio::test]
    async fn test_in_scope_read_and_write() {
        let reg = registry();
        reg.put(NS, &key("type:Input"), "Doc", json!({"body": "in"}), "$seed", 0)
            .await
            .unwrap();
        let scope = scope(&reg);

        assert_eq!(scope.get(&key("type:Input")).await.unwrap().payload, json!({"body": "in"}));
        assert_eq!(scope.put(&key("type:Output"), json!({"body": "out"})).await.unwrap(), 1);
        // Own outputs are readable.
        assert_eq!(scope.get(&key("type:Output")).await.unwrap().produced_by, "writer");

        assert!(scope.has_written(&key("type:Output")));
        assert!(scope.violations().is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites_latest_version() {
        let reg = registry();
        let scope = scope(&reg);
        scope.put(&key("type:Output"), json!({"body": "1"})).await.unwrap();
        let v = scope.put(&key("type:Output"), json!({"body": "2"})).await.unwrap();
        assert_eq!(v, 2);
        assert_eq!(scope.written().get(&key("type:Output")), Some(&2));
    }

    #[tokio::test]
    async fn test_out_of_scope_access_recorded() {
        let reg = registry();
        let scope = scope(&reg);

        let err = scope.get(&key("type:Secret")).await.unwrap_err();
        assert!(matches!(err, RegistryError::ScopeViolation { access: AccessKind::Read, .. }));

        let err = scope.put(&key("type:Input"), json!({"body": "x"})).await.unwrap_err();
        assert!(matches!(err, RegistryError::ScopeViolation { access: AccessKind::Write, .. }));

        assert_eq!(
            scope.violations(),
            vec![
                ScopeViolationRecord {
                    key: key("type:Secret"),
                    access: AccessKind::Read
                },
                ScopeViolationRecord {
                    key: key("type:Input"),
                    access: AccessKind::Write
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_payload_recorded() {
        let reg = registry();
        let scope = scope(&reg);

        let err = scope.put(&key("type:Output"), json!({"body": 5})).await.unwrap_err();
        assert!(matches!(err, RegistryError::SchemaMismatch { .. }));
        assert_eq!(scope.rejected_writes().len(), 1);
        assert!(!scope.has_written(&key("type:Output")));
    }

    #[tokio::test]
    async fn test_put_expecting_conflict_not_retried() {
        let reg = registry();
        let scope = scope(&reg);
        scope.put(&key("type:Output"), json!({"body": "1"})).await.unwrap();

        let err = scope
            .put_expecting(&key("type:Output"), json!({"body": "2"}), 0)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(scope.conflict_exhausted().is_none());
    }

    #[tokio::test]
    async fn test_conflict_exhaustion_recorded() {
        let schemas = Arc::clone(registry().schemas());
        let reg = Arc::new(TypeRegistry::new(Arc::new(crate::testing::ContendedBackend::new()), schemas));
        let scope = scope(&reg).with_retry_policy(
            ConflictRetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None),
        );

        let err = scope.put(&key("type:Output"), json!({"body": "x"})).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(scope.conflict_exhausted(), Some(key("type:Output")));
        assert!(!scope.has_written(&key("type:Output")));
    }

    #[tokio::test]
    async fn test_scan_skips_out_of_scope_keys() {
        let reg = registry();
        for name in ["Input", "Output", "Other"] {
            reg.put(NS, &key(&format!("type:{name}")), "Doc", json!({"body": name}), "$seed", 0)
                .await
                .unwrap();
        }
        let scope = scope(&reg).with_retry_policy(ConflictRetryPolicy::new().with_jitter(JitterStrategy::None));

        let seen: Vec<Artifact> = scope.scan("type:").try_collect().await.unwrap();
        let names: Vec<_> = seen.iter().map(|a| a.key.name()).collect();
        assert_eq!(names, vec!["Input", "Output"]);
        assert!(scope.violations().is_empty());
    }

    #[tokio::test]
    async fn test_revoked_scope_rejects_without_recording() {
        let reg = registry();
        let scope = scope(&reg);
        let clone = scope.clone();
        scope.revoke();

        assert!(clone.put(&key("type:Output"), json!({"body": "late"})).await.is_err());
        assert!(clone.violations().is_empty());
        assert_eq!(reg.current_version(NS, &key("type:Output")).await.unwrap(), 0);
    }
}
