//! Persistence of workflow instances.

use super::instance::WorkflowInstance;
use crate::errors::WorkflowError;
use crate::store::KvBackend;
use crate::utils::{instance_id_from_namespace, instance_namespace};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Key of the instance record inside its namespace.
pub const INSTANCE_RECORD_KEY: &str = "$instance";

/// Loads and saves instance records with compare-and-set.
#[derive(Clone)]
pub struct InstanceStore {
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceStore").finish_non_exhaustive()
    }
}

impl InstanceStore {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Persists a new instance. Fails if the id is already taken.
    pub async fn create(&self, instance: &WorkflowInstance) -> Result<u64, WorkflowError> {
        self.save(instance, 0).await
    }

    /// Loads an instance and the version of its record.
    pub async fn load(&self, instance_id: Uuid) -> Result<(WorkflowInstance, u64), WorkflowError> {
        let record = self
            .backend
            .get(&instance_namespace(&instance_id), INSTANCE_RECORD_KEY)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(instance_id))?;
        let instance: WorkflowInstance = serde_json::from_value(record.value)?;
        Ok((instance, record.version))
    }

    /// Writes the instance if its stored version still equals `expected`.
    pub async fn save(&self, instance: &WorkflowInstance, expected: u64) -> Result<u64, WorkflowError> {
        let value = serde_json::to_value(instance)?;
        let version = self
            .backend
            .compare_and_set(&instance.namespace(), INSTANCE_RECORD_KEY, expected, value)
            .await?;
        debug!(
            instance_id = %instance.instance_id,
            status = %instance.status,
            version,
            "Saved workflow instance"
        );
        Ok(version)
    }

    /// Loads every stored instance, oldest first.
    pub async fn list(&self) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        let mut ids: Vec<Uuid> = self
            .backend
            .namespaces()
            .await?
            .iter()
            .filter_map(|ns| instance_id_from_namespace(ns))
            .collect();
        ids.sort();

        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id).await {
                Ok((instance, _)) => instances.push(instance),
                // Artifacts written before the record landed.
                Err(WorkflowError::InstanceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(instances)
    }
}
