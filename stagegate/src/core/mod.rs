//! Core domain model types.
//!
//! - Artifact keys and versioned artifacts
//! - Issue reports
//! - Workflow status, stage outcome and stage kind

mod artifact;
mod issue;
mod status;

pub use artifact::{
    payload_digest, Artifact, ArtifactKey, ArtifactKeyError, OPERATOR_PRODUCER, RESERVED_KEY_PREFIX,
    SEED_PRODUCER,
};
pub use issue::{IssueCategory, IssueReport, Severity};
pub use status::{Outcome, StageKind, WorkflowStatus};
