//! Artifact contracts: schema model, schema registry and payload validation.
//!
//! This module provides:
//! - [`Schema`] declarations with typed fields and constraints
//! - A [`SchemaRegistry`] that freezes schemas once artifacts reference them
//! - An [`ArtifactValidator`] that checks payloads structurally

mod registry;
mod schema;
mod validator;

pub use registry::{SchemaCompatibilityReport, SchemaMetadata, SchemaRegistry};
pub use schema::{Constraint, FieldSpec, FieldType, Schema};
pub use validator::ArtifactValidator;
