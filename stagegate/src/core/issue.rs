//! Structured issue reports attached to failing handoffs.

use super::ArtifactKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How serious an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic or advisory.
    Low,
    /// Needs attention before the run can complete.
    #[default]
    Medium,
    /// Blocks the run.
    High,
    /// Blocks the run and indicates a defect in the workflow definition.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Why a stage rejected forward progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// An artifact failed a semantic check.
    Validation,
    /// An artifact is missing required content.
    Incomplete,
    /// The stage did not hand off before its deadline.
    Timeout,
    /// A retry ceiling was exceeded.
    MaxRetriesExceeded,
    /// The adapter broke the handoff or access contract.
    ContractViolation,
    /// The run was cancelled by an operator.
    Cancelled,
    /// Required inputs never appeared in the registry.
    MissingInput,
    /// A worker-defined category.
    Custom(String),
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::Timeout => write!(f, "timeout"),
            Self::MaxRetriesExceeded => write!(f, "max_retries_exceeded"),
            Self::ContractViolation => write!(f, "contract_violation"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::MissingInput => write!(f, "missing_input"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Structured explanation of a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    /// Severity of the issue.
    #[serde(default)]
    pub severity: Severity,
    /// Category of the issue.
    pub category: IssueCategory,
    /// Short human-readable description.
    #[serde(default)]
    pub summary: String,
    /// Artifact keys implicated by the issue.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<ArtifactKey>,
    /// Stage expected to fix the issue, if the reporter knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_stage: Option<String>,
}

impl IssueReport {
    /// Creates a new issue report with medium severity.
    #[must_use]
    pub fn new(category: IssueCategory, summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::default(),
            category,
            summary: summary.into(),
            evidence_refs: Vec::new(),
            required_stage: None,
        }
    }

    /// Synthetic report for a stage that missed its deadline.
    #[must_use]
    pub fn timeout(stage: &str, timeout_ms: u64) -> Self {
        Self::new(
            IssueCategory::Timeout,
            format!("Stage '{stage}' did not hand off within {timeout_ms}ms"),
        )
        .with_severity(Severity::High)
    }

    /// Synthetic report for an exhausted retry ceiling.
    #[must_use]
    pub fn max_retries_exceeded(stage: &str, max_retries: u32) -> Self {
        Self::new(
            IssueCategory::MaxRetriesExceeded,
            format!("Stage '{stage}' exceeded the retry ceiling of {max_retries}"),
        )
        .with_severity(Severity::Critical)
        .with_required_stage(stage)
    }

    /// Sets the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Adds an implicated artifact key.
    #[must_use]
    pub fn with_evidence(mut self, key: ArtifactKey) -> Self {
        if !self.evidence_refs.contains(&key) {
            self.evidence_refs.push(key);
        }
        self
    }

    /// Adds several implicated artifact keys.
    #[must_use]
    pub fn with_evidence_refs(mut self, keys: impl IntoIterator<Item = ArtifactKey>) -> Self {
        for key in keys {
            self = self.with_evidence(key);
        }
        self
    }

    /// Names the stage expected to fix the issue.
    #[must_use]
    pub fn with_required_stage(mut self, stage: impl Into<String>) -> Self {
        self.required_stage = Some(stage.into());
        self
    }
}

impl fmt::Display for IssueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.severity, self.category, self.summary)
    }
}
