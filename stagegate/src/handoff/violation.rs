//! Contract violations raised by adapters.

use crate::core::{ArtifactKey, IssueCategory, IssueReport, Severity};
use crate::errors::AccessKind;
use thiserror::Error;

/// A breach of the handoff or access contract. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// A successful handoff did not produce a mandatory output.
    #[error("Stage '{stage}' reported success without producing mandatory artifact '{key}'")]
    MissingMandatoryWrite {
        /// The stage.
        stage: String,
        /// The missing key.
        key: ArtifactKey,
    },

    /// The envelope lists a key outside the write set.
    #[error("Stage '{stage}' listed '{key}', which is not in its write set")]
    UndeclaredWrite {
        /// The stage.
        stage: String,
        /// The listed key.
        key: ArtifactKey,
    },

    /// The envelope lists a key the stage never wrote.
    #[error("Stage '{stage}' listed '{key}' but never wrote it")]
    UnwrittenProducedKey {
        /// The stage.
        stage: String,
        /// The listed key.
        key: ArtifactKey,
    },

    /// A failure envelope carried no issue report.
    #[error("Stage '{stage}' reported failure without an issue report")]
    MissingIssueReport {
        /// The stage.
        stage: String,
    },

    /// The adapter touched a key outside its scope.
    #[error("Stage '{stage}' attempted to {access} '{key}' outside its declared scope")]
    ScopeViolation {
        /// The stage.
        stage: String,
        /// The key.
        key: ArtifactKey,
        /// Read or write.
        access: AccessKind,
    },

    /// The adapter tried to store a payload its schema rejects.
    #[error("Stage '{stage}' wrote an invalid payload to '{key}': {reason}")]
    InvalidPayload {
        /// The stage.
        stage: String,
        /// The key.
        key: ArtifactKey,
        /// Validator message.
        reason: String,
    },

    /// The adapter task panicked.
    #[error("Adapter for stage '{stage}' panicked: {message}")]
    AdapterPanicked {
        /// The stage.
        stage: String,
        /// Panic payload, if it was a string.
        message: String,
    },
}

impl ContractViolation {
    /// The stage that broke the contract.
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::MissingMandatoryWrite { stage, .. }
            | Self::UndeclaredWrite { stage, .. }
            | Self::UnwrittenProducedKey { stage, .. }
            | Self::MissingIssueReport { stage }
            | Self::ScopeViolation { stage, .. }
            | Self::InvalidPayload { stage, .. }
            | Self::AdapterPanicked { stage, .. } => stage,
        }
    }

    /// The artifact key involved, if any.
    #[must_use]
    pub fn key(&self) -> Option<&ArtifactKey> {
        match self {
            Self::MissingMandatoryWrite { key, .. }
            | Self::UndeclaredWrite { key, .. }
            | Self::UnwrittenProducedKey { key, .. }
            | Self::ScopeViolation { key, .. }
            | Self::InvalidPayload { key, .. } => Some(key),
            Self::MissingIssueReport { .. } | Self::AdapterPanicked { .. } => None,
        }
    }

    /// Converts the violation into the issue recorded on the aborted run.
    #[must_use]
    pub fn to_issue(&self) -> IssueReport {
        let issue = IssueReport::new(IssueCategory::ContractViolation, self.to_string())
            .with_severity(Severity::Critical)
            .with_required_stage(self.stage());
        match self.key() {
            Some(key) => issue.with_evidence(key.clone()),
            None => issue,
        }
    }
}
