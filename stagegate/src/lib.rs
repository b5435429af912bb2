//! # Stagegate
//!
//! A coordinator for gated, branchable workflows whose stages are run by
//! opaque agents.
//!
//! Stagegate provides:
//!
//! - **Typed artifacts**: a versioned registry that validates every payload
//!   against a registered schema
//! - **Handoff contracts**: stages declare what they read and write, and
//!   every handoff is checked against that declaration
//! - **Routing tables**: explicit success and failure edges, validated up front
//! - **Bounded remediation**: failure loops are capped by a retry ceiling
//! - **Cancellation**: runs can be interrupted at any point
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagegate::prelude::*;
//!
//! let table = RoutingTable::builder("plan")
//!     .seed(request.clone(), "Request")
//!     .stage(StageDefinition::work("plan").reads(request).writes(plan.clone(), "Plan").on_success("review"))
//!     .stage(StageDefinition::gate("review").reads(plan).on_success(Transition::Completed).on_failure("plan"))
//!     .build()?;
//!
//! let coordinator = Coordinator::builder(table)
//!     .with_schemas(schemas)
//!     .with_adapter("plan", planner)
//!     .with_adapter("review", GateAdapter::new(policy))
//!     .build()?;
//!
//! let id = coordinator.start_default(seed).await?;
//! let instance = coordinator.run(id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod agents;
pub mod cancellation;
pub mod config;
pub mod contracts;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod handoff;
pub mod observability;
pub mod registry;
pub mod routing;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agents::{AgentAdapter, FnAdapter, GateAdapter, GatePolicy, Invocation, RequiredFieldsPolicy};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{CoordinatorConfig, LoggingConfig};
    pub use crate::contracts::{FieldSpec, FieldType, Schema, SchemaRegistry};
    pub use crate::coordinator::{Applied, Coordinator, Inspector, NextState, StepReport, WorkflowInstance};
    pub use crate::core::{Artifact, ArtifactKey, IssueCategory, IssueReport, Outcome, Severity, WorkflowStatus};
    pub use crate::errors::{RegistryError, WorkflowError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::handoff::{ContractViolation, HandoffEnvelope};
    pub use crate::registry::{ConflictRetryPolicy, ScopedRegistry, TypeRegistry};
    pub use crate::routing::{RoutingTable, StageDefinition, Transition};
    pub use crate::store::{InMemoryBackend, KvBackend};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
