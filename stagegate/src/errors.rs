//! Error types for the stagegate coordinator.
//!
//! Failures a workflow can recover from (business failures, timeouts) are
//! not errors: they are recorded on the instance. The types here cover
//! configuration mistakes, registry faults and operator misuse.

use crate::core::{ArtifactKey, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for coordinator operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The routing table is malformed.
    #[error("{0}")]
    Routing(#[from] RoutingValidationError),

    /// A schema could not be registered.
    #[error("{0}")]
    Schema(#[from] SchemaError),

    /// A registry operation failed.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The storage backend failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// No instance with this id exists.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// The instance already reached a terminal status.
    #[error("Workflow instance {instance_id} is already {status}")]
    InstanceTerminal {
        /// The instance id.
        instance_id: Uuid,
        /// Its terminal status.
        status: WorkflowStatus,
    },

    /// A stage id is not part of the routing table.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// A seed artifact was supplied for a key the routing table does not declare.
    #[error("Seed key '{0}' is not declared by the routing table")]
    UndeclaredSeed(ArtifactKey),

    /// A stage has no adapter bound to it.
    #[error("No adapter registered for stage '{0}'")]
    MissingAdapter(String),

    /// A replayed envelope names a stage the instance is not waiting on.
    #[error("Stale envelope for instance {instance_id}: stage '{stage}' reported, but '{expected}' is active")]
    StaleEnvelope {
        /// The instance id.
        instance_id: Uuid,
        /// The stage named by the envelope.
        stage: String,
        /// The stage the instance is waiting on.
        expected: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Whether an access attempt was a read or a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    /// `get` or `scan`.
    Read,
    /// `put`.
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Errors returned by the type registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The schema id was never registered.
    #[error("Unknown schema '{0}'")]
    UnknownSchema(String),

    /// The payload does not satisfy its schema.
    #[error("Artifact '{key}' does not match schema '{schema_id}': {source}")]
    SchemaMismatch {
        /// The artifact key.
        key: ArtifactKey,
        /// The schema the payload was checked against.
        schema_id: String,
        /// The first validation failure.
        #[source]
        source: ValidationError,
    },

    /// The expected previous version did not match the stored version.
    #[error("Version conflict on '{key}': expected version {expected}, found {actual}")]
    VersionConflict {
        /// The artifact key.
        key: ArtifactKey,
        /// Version the writer expected to replace.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// No artifact is stored under this key.
    #[error("Artifact not found: {key}")]
    NotFound {
        /// The artifact key.
        key: ArtifactKey,
    },

    /// A scoped handle tried to touch a key outside its declared sets.
    #[error("Stage '{stage}' attempted to {access} '{key}' outside its declared scope")]
    ScopeViolation {
        /// The stage holding the scope.
        stage: String,
        /// The key it tried to access.
        key: ArtifactKey,
        /// Read or write.
        access: AccessKind,
    },

    /// A stored record could not be decoded.
    #[error("Corrupt artifact record '{key}': {reason}")]
    Corrupt {
        /// The raw storage key.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// The storage backend failed.
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Returns true for transient errors a writer may retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Structural validation failures reported by the artifact validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The schema id was never registered.
    #[error("Unknown schema '{0}'")]
    UnknownSchema(String),

    /// A required field is absent (or null).
    #[error("Missing required field '{0}'")]
    MissingField(String),

    /// A field has the wrong JSON type.
    #[error("Field '{field}' has the wrong type: expected {expected}")]
    TypeMismatch {
        /// Path of the field.
        field: String,
        /// The declared type.
        expected: String,
    },

    /// A declared constraint does not hold.
    #[error("Field '{field}' violates constraint {rule}")]
    ConstraintViolation {
        /// Path of the field.
        field: String,
        /// Description of the violated rule.
        rule: String,
    },

    /// A field is present that the schema does not declare.
    #[error("Field '{0}' is not declared by the schema")]
    UnknownField(String),
}

/// Errors raised while registering schemas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Schema ids must be non-empty.
    #[error("Schema id cannot be empty or whitespace-only")]
    EmptyId,

    /// The schema is referenced by a stored artifact and cannot change.
    #[error("Schema '{0}' is referenced by stored artifacts and cannot be redefined; register a new schema id instead")]
    Immutable(String),

    /// The schema references an unregistered schema.
    #[error("Schema '{schema_id}' references unknown schema '{reference}'")]
    UnknownReference {
        /// The schema being registered.
        schema_id: String,
        /// The missing reference.
        reference: String,
    },

    /// Nested schema references form a cycle.
    #[error("Cyclic schema reference: {}", path.join(" -> "))]
    Cycle {
        /// The reference chain forming the cycle.
        path: Vec<String>,
    },

    /// A pattern constraint is not a valid regular expression.
    #[error("Schema '{schema_id}' field '{field}' has invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The schema id.
        schema_id: String,
        /// The field path.
        field: String,
        /// The offending pattern.
        pattern: String,
        /// Regex compiler message.
        reason: String,
    },

    /// A constraint is malformed (e.g. min greater than max).
    #[error("Schema '{schema_id}' field '{field}' has an invalid constraint: {reason}")]
    InvalidConstraint {
        /// The schema id.
        schema_id: String,
        /// The field path.
        field: String,
        /// What is wrong.
        reason: String,
    },
}

/// Errors returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Compare-and-set lost: the stored version differs from the expected one.
    #[error("Store conflict on {namespace}/{key}: expected version {expected}, found {actual}")]
    Conflict {
        /// The namespace.
        namespace: String,
        /// The logical key.
        key: String,
        /// Expected version.
        expected: u64,
        /// Stored version.
        actual: u64,
    },

    /// The backend is unavailable or failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Metadata about a routing-table error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "ROUTING-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Stable error codes for routing-table validation.
pub mod codes {
    /// The table has no stages.
    pub const EMPTY: &str = "ROUTING-001-EMPTY";
    /// Duplicate or blank stage id.
    pub const INVALID_STAGE: &str = "ROUTING-002-INVALID_STAGE";
    /// A transition points at a stage that does not exist.
    pub const UNKNOWN_TARGET: &str = "ROUTING-003-UNKNOWN_TARGET";
    /// The success edges form a cycle.
    pub const CYCLE: &str = "ROUTING-004-CYCLE";
    /// A stage cannot be reached from the entry stage.
    pub const UNREACHABLE: &str = "ROUTING-005-UNREACHABLE";
    /// A failure edge points at the success marker.
    pub const FAILURE_TO_SUCCESS: &str = "ROUTING-006-FAILURE_TO_SUCCESS";
    /// A required read key is never produced.
    pub const UNPRODUCED_READ: &str = "ROUTING-007-UNPRODUCED_READ";
    /// The success marker cannot be reached at all.
    pub const NO_COMPLETION: &str = "ROUTING-008-NO_COMPLETION";
    /// An artifact key has more than one writer.
    pub const SHARED_WRITE: &str = "ROUTING-009-SHARED_WRITE";
}

/// Error raised when routing-table validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RoutingValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional structured error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl RoutingValidationError {
    /// Creates a new routing validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the structured error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when the success edges of a routing table form a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in success edges: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            codes::CYCLE,
            format!("Success edges contain a cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Route loops through failure edges so the retry ceiling can bound them.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for RoutingValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}
