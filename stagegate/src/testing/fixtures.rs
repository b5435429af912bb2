//! Ready-made schemas and routing tables for tests.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::contracts::{Constraint, FieldSpec, FieldType, Schema, SchemaRegistry};
use crate::core::ArtifactKey;
use crate::errors::WorkflowError;
use crate::routing::{RoutingTable, StageDefinition, Transition};

/// Schema id of the request artifact.
pub const REQUEST_SCHEMA: &str = "Request";
/// Schema id of the plan artifact.
pub const PLAN_SCHEMA: &str = "Plan";

/// The three-stage intake / plan / review workflow.
///
/// `intake` writes `type:Request`, `plan` turns it into `type:Plan`, and the
/// `review` gate either completes the run or routes back to `plan`.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Registered schemas.
    pub schemas: Arc<SchemaRegistry>,
    /// The routing table.
    pub table: RoutingTable,
    /// `type:Request`.
    pub request: ArtifactKey,
    /// `type:Plan`.
    pub plan: ArtifactKey,
}

impl Scenario {
    /// Builds the scenario with its default table.
    pub fn new() -> Result<Self, WorkflowError> {
        let schemas = scenario_schemas()?;
        let request = ArtifactKey::new("type", "Request").map_err(|e| WorkflowError::Internal(e.to_string()))?;
        let plan = ArtifactKey::new("type", "Plan").map_err(|e| WorkflowError::Internal(e.to_string()))?;

        let table = RoutingTable::builder("intake")
            .stage(
                StageDefinition::work("intake")
                    .writes(request.clone(), REQUEST_SCHEMA)
                    .on_success("plan"),
            )
            .stage(
                StageDefinition::work("plan")
                    .reads(request.clone())
                    .writes(plan.clone(), PLAN_SCHEMA)
                    .on_success("review"),
            )
            .stage(
                StageDefinition::gate("review")
                    .reads(plan.clone())
                    .on_success(Transition::Completed)
                    .on_failure("plan"),
            )
            .build()?;

        Ok(Self {
            schemas,
            table,
            request,
            plan,
        })
    }

    /// Same stages, but `type:Request` is supplied as a seed and the run
    /// starts at `plan`.
    pub fn seeded() -> Result<Self, WorkflowError> {
        let base = Self::new()?;
        let table = RoutingTable::builder("plan")
            .seed(base.request.clone(), REQUEST_SCHEMA)
            .stage(
                StageDefinition::work("plan")
                    .reads(base.request.clone())
                    .writes(base.plan.clone(), PLAN_SCHEMA)
                    .on_success("review"),
            )
            .stage(
                StageDefinition::gate("review")
                    .reads(base.plan.clone())
                    .on_success(Transition::Completed)
                    .on_failure("plan"),
            )
            .build()?;
        Ok(Self { table, ..base })
    }
}

/// Registers the `Request` and `Plan` schemas.
pub fn scenario_schemas() -> Result<Arc<SchemaRegistry>, WorkflowError> {
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register(
        Schema::new(REQUEST_SCHEMA)
            .with_description("What the operator asked for")
            .field(
                "title",
                FieldSpec::required(FieldType::String).with_constraint(Constraint::MinLength(1)),
            ),
    )?;
    schemas.register(
        Schema::new(PLAN_SCHEMA)
            .field("steps", FieldSpec::required(FieldType::array_of(FieldType::String)))
            .field("revision", FieldSpec::optional(FieldType::Integer)),
    )?;
    Ok(schemas)
}

/// A valid `Request` payload.
#[must_use]
pub fn request_payload(title: &str) -> Value {
    json!({ "title": title })
}

/// A valid `Plan` payload.
#[must_use]
pub fn plan_payload(steps: &[&str]) -> Value {
    json!({ "steps": steps })
}
