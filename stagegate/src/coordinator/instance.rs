//! Workflow instance state and history.

use crate::core::{ArtifactKey, IssueReport, Outcome, WorkflowStatus};
use crate::routing::Transition;
use crate::utils::{instance_namespace, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Where an instance went after a stage handed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextState {
    /// Another stage runs next.
    Stage(String),
    /// The success marker was reached.
    Completed,
    /// The failure marker was reached.
    Failed,
    /// The run was forced to stop.
    Aborted,
}

impl NextState {
    /// Status an instance has after moving to this state.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        match self {
            Self::Stage(_) => WorkflowStatus::Running,
            Self::Completed => WorkflowStatus::Completed,
            Self::Failed => WorkflowStatus::Failed,
            Self::Aborted => WorkflowStatus::Aborted,
        }
    }

    /// The next stage id, if any.
    #[must_use]
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::Stage(id) => Some(id),
            _ => None,
        }
    }
}

impl From<Transition> for NextState {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Stage(id) => Self::Stage(id),
            Transition::Completed => Self::Completed,
            Transition::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for NextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(id) => write!(f, "{id}"),
            Self::Completed => write!(f, "$completed"),
            Self::Failed => write!(f, "$failed"),
            Self::Aborted => write!(f, "$aborted"),
        }
    }
}

/// One recorded stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Position in the history, starting at 1.
    pub sequence: u64,
    /// The stage that ran.
    pub stage: String,
    /// What it reported.
    pub outcome: Outcome,
    /// The issue attached to a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<IssueReport>,
    /// Where the instance went next.
    pub next: NextState,
    /// Keys the stage wrote.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produced_keys: Vec<ArtifactKey>,
    /// When the entry was recorded.
    pub timestamp: Timestamp,
}

/// Durable state of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// The instance id (UUID v7).
    pub instance_id: Uuid,
    /// Stage the run started at.
    pub entry_stage: String,
    /// Stage to run next; `None` once terminal.
    pub current_stage: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Every stage execution, in order.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Entries into each stage through failure edges.
    #[serde(default)]
    pub failure_visits: BTreeMap<String, u32>,
    /// The most recent issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_issue: Option<IssueReport>,
    /// Versions of the current stage's write set when it became current.
    /// Absent keys had no version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub write_baseline: BTreeMap<ArtifactKey, u64>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

impl WorkflowInstance {
    /// Creates a running instance positioned at `entry_stage`.
    #[must_use]
    pub fn new(instance_id: Uuid, entry_stage: impl Into<String>) -> Self {
        let entry_stage = entry_stage.into();
        let now = now_utc();
        Self {
            instance_id,
            current_stage: Some(entry_stage.clone()),
            entry_stage,
            status: WorkflowStatus::Running,
            history: Vec::new(),
            failure_visits: BTreeMap::new(),
            last_issue: None,
            write_baseline: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage namespace holding the instance and its artifacts.
    #[must_use]
    pub fn namespace(&self) -> String {
        instance_namespace(&self.instance_id)
    }

    /// Sequence number the next history entry will get.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.history.len() as u64 + 1
    }

    /// Returns true once no further stage will run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if a history entry with this sequence exists.
    #[must_use]
    pub fn has_sequence(&self, sequence: u64) -> bool {
        self.history.iter().any(|e| e.sequence == sequence)
    }

    /// Failure-edge entries recorded for a stage.
    #[must_use]
    pub fn failure_visits(&self, stage: &str) -> u32 {
        self.failure_visits.get(stage).copied().unwrap_or(0)
    }

    /// Version a write-set key held before the current stage ran (0 if absent).
    #[must_use]
    pub fn baseline_version(&self, key: &ArtifactKey) -> u64 {
        self.write_baseline.get(key).copied().unwrap_or(0)
    }

    /// Number of history entries for a stage.
    #[must_use]
    pub fn visits(&self, stage: &str) -> usize {
        self.history.iter().filter(|e| e.stage == stage).count()
    }

    /// Appends a history entry and moves the instance to `next`.
    ///
    /// `issue` is the stage's own issue; `final_issue` overrides
    /// `last_issue` when the coordinator substitutes a synthetic one.
    pub(crate) fn record(
        &mut self,
        stage: &str,
        outcome: Outcome,
        issue: Option<IssueReport>,
        produced_keys: Vec<ArtifactKey>,
        next: NextState,
        final_issue: Option<IssueReport>,
    ) -> &HistoryEntry {
        let now = now_utc();
        if let Some(final_issue) = final_issue.or_else(|| issue.clone()) {
            self.last_issue = Some(final_issue);
        }
        self.status = next.status();
        self.current_stage = next.stage_id().map(str::to_string);
        self.write_baseline.clear();
        self.updated_at = now;

        let sequence = self.next_sequence();
        self.history.push(HistoryEntry {
            sequence,
            stage: stage.to_string(),
            outcome,
            issue,
            next,
            produced_keys,
            timestamp: now,
        });
        &self.history[self.history.len() - 1]
    }
}
