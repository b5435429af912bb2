//! Read-only inspection of instances and their artifacts.

use super::instance::{HistoryEntry, WorkflowInstance};
use super::instance_store::InstanceStore;
use crate::core::{Artifact, ArtifactKey, WorkflowStatus};
use crate::errors::WorkflowError;
use crate::registry::TypeRegistry;
use crate::utils::{instance_namespace, Timestamp};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// One line of [`Inspector::list_instances`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    /// The instance id.
    pub instance_id: Uuid,
    /// Current status.
    pub status: WorkflowStatus,
    /// Stage that runs next, if running.
    pub current_stage: Option<String>,
    /// Number of history entries.
    pub steps: usize,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

impl From<&WorkflowInstance> for InstanceSummary {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.instance_id,
            status: instance.status,
            current_stage: instance.current_stage.clone(),
            steps: instance.history.len(),
            updated_at: instance.updated_at,
        }
    }
}

/// Read-only view used by operators and tooling.
#[derive(Debug, Clone)]
pub struct Inspector {
    registry: Arc<TypeRegistry>,
    instances: InstanceStore,
}

impl Inspector {
    pub(crate) fn new(registry: Arc<TypeRegistry>, instances: InstanceStore) -> Self {
        Self { registry, instances }
    }

    /// Full instance record.
    pub async fn instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, WorkflowError> {
        Ok(self.instances.load(instance_id).await?.0)
    }

    /// Current status.
    pub async fn status(&self, instance_id: Uuid) -> Result<WorkflowStatus, WorkflowError> {
        Ok(self.instance(instance_id).await?.status)
    }

    /// Recorded history, oldest first.
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<HistoryEntry>, WorkflowError> {
        Ok(self.instance(instance_id).await?.history)
    }

    /// Summaries of every stored instance, oldest first.
    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, WorkflowError> {
        Ok(self
            .instances
            .list()
            .await?
            .iter()
            .map(InstanceSummary::from)
            .collect())
    }

    /// Latest version of an artifact in an instance.
    pub async fn get_artifact(&self, instance_id: Uuid, key: &ArtifactKey) -> Result<Artifact, WorkflowError> {
        Ok(self.registry.get(&instance_namespace(&instance_id), key).await?)
    }

    /// Streams the artifacts of an instance whose key starts with `prefix`.
    pub fn scan_artifacts(&self, instance_id: Uuid, prefix: &str) -> BoxStream<'static, Result<Artifact, WorkflowError>> {
        self.registry
            .scan(&instance_namespace(&instance_id), prefix)
            .map(|item| item.map_err(WorkflowError::from))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Outcome;
    use crate::coordinator::NextState;

    #[test]
    fn test_summary_tracks_progress() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), "plan");
        let summary = InstanceSummary::from(&instance);
        assert_eq!(summary.steps, 0);
        assert_eq!(summary.current_stage.as_deref(), Some("plan"));

        instance.record("plan", Outcome::Success, None, Vec::new(), NextState::Completed, None);
        let summary = InstanceSummary::from(&instance);
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(summary.steps, 1);
        assert!(summary.current_stage.is_none());
    }
}
