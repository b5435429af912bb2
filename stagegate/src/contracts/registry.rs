//! Schema registry: registration, immutability and compatibility diffs.

use super::schema::{Constraint, FieldSpec, FieldType, Schema};
use crate::errors::SchemaError;
use crate::utils::{now_utc, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Registration metadata for a schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMetadata {
    /// Schema id.
    pub id: String,
    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When the current definition was registered.
    pub registered_at: Timestamp,
    /// Whether a stored artifact references the schema.
    pub referenced: bool,
}

/// Simple compatibility diff between two schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCompatibilityReport {
    /// Source schema id.
    pub from_schema: String,
    /// Target schema id.
    pub to_schema: String,
    /// Breaking changes detected.
    pub breaking_changes: Vec<String>,
    /// Non-breaking warnings.
    pub warnings: Vec<String>,
}

impl SchemaCompatibilityReport {
    /// True when no breaking changes were detected.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.breaking_changes.is_empty()
    }

    /// Human readable summary string.
    #[must_use]
    pub fn summary(&self) -> String {
        let status = if self.is_compatible() {
            "compatible"
        } else {
            "breaking"
        };
        format!(
            "Schema diff {}->{}: {} (breaking={}, warnings={})",
            self.from_schema,
            self.to_schema,
            status,
            self.breaking_changes.len(),
            self.warnings.len()
        )
    }
}

#[derive(Debug)]
struct SchemaEntry {
    schema: Arc<Schema>,
    registered_at: Timestamp,
    referenced: bool,
}

/// In-memory registry of artifact schemas.
///
/// A schema may be redefined until a write against it is attempted;
/// after that only an identical re-registration is accepted.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: RwLock<HashMap<String, SchemaEntry>>,
}

impl SchemaRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema is malformed, references an unknown
    /// schema, introduces a reference cycle, or redefines a referenced schema.
    pub fn register(&self, schema: Schema) -> Result<Arc<Schema>, SchemaError> {
        if schema.id.trim().is_empty() {
            return Err(SchemaError::EmptyId);
        }
        check_fields(&schema)?;

        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&schema.id) {
            if *existing.schema == schema {
                return Ok(Arc::clone(&existing.schema));
            }
            if existing.referenced {
                return Err(SchemaError::Immutable(schema.id));
            }
            debug!(schema_id = %schema.id, "Replacing unreferenced schema definition");
        }

        for reference in schema.references() {
            if reference != schema.id && !entries.contains_key(&reference) {
                return Err(SchemaError::UnknownReference {
                    schema_id: schema.id.clone(),
                    reference,
                });
            }
        }

        if let Some(path) = find_cycle(&schema, &entries) {
            return Err(SchemaError::Cycle { path });
        }

        let schema = Arc::new(schema);
        entries.insert(
            schema.id.clone(),
            SchemaEntry {
                schema: Arc::clone(&schema),
                registered_at: now_utc(),
                referenced: false,
            },
        );
        Ok(schema)
    }

    /// Fetches a schema by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Schema>> {
        self.entries.read().get(id).map(|e| Arc::clone(&e.schema))
    }

    /// Returns true if the schema id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Marks a schema (and every schema it references) as referenced by an
    /// artifact write, freezing their definitions.
    pub fn mark_referenced(&self, id: &str) {
        let mut entries = self.entries.write();
        let mut pending = vec![id.to_string()];
        let mut seen = HashSet::new();

        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(entry) = entries.get_mut(&current) {
                entry.referenced = true;
                pending.extend(entry.schema.references());
            }
        }
    }

    /// Returns true if a stored artifact references the schema.
    #[must_use]
    pub fn is_referenced(&self, id: &str) -> bool {
        self.entries.read().get(id).is_some_and(|e| e.referenced)
    }

    /// Returns metadata for every registered schema, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<SchemaMetadata> {
        let entries = self.entries.read();
        let mut result: Vec<_> = entries
            .values()
            .map(|e| SchemaMetadata {
                id: e.schema.id.clone(),
                description: e.schema.description.clone(),
                registered_at: e.registered_at,
                referenced: e.referenced,
            })
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Computes compatibility between two registered schemas, typically an
    /// old schema id and the new id that supersedes it.
    ///
    /// Returns `None` if either schema is not registered.
    #[must_use]
    pub fn diff(&self, from_schema: &str, to_schema: &str) -> Option<SchemaCompatibilityReport> {
        let left = self.get(from_schema)?;
        let right = self.get(to_schema)?;

        let mut breaking = Vec::new();
        let mut warnings = Vec::new();

        // Removed fields -> breaking
        for field in left.fields.keys() {
            if !right.fields.contains_key(field) {
                breaking.push(format!("Field '{field}' removed"));
            }
        }

        for (field, spec) in &right.fields {
            let Some(old) = left.fields.get(field) else {
                if spec.required {
                    breaking.push(format!("Required field '{field}' added"));
                } else {
                    warnings.push(format!("Optional field '{field}' added"));
                }
                continue;
            };

            if old.field_type != spec.field_type {
                breaking.push(format!(
                    "Field '{}' changed type {} -> {}",
                    field,
                    old.field_type.describe(),
                    spec.field_type.describe()
                ));
            }
            if !old.required && spec.required {
                breaking.push(format!("Field '{field}' became required"));
            }
            if old.constraints != spec.constraints {
                warnings.push(format!("Field '{field}' constraints changed"));
            }
        }

        if left.allow_unknown_fields && !right.allow_unknown_fields {
            breaking.push("Unknown fields are no longer allowed".to_string());
        }

        Some(SchemaCompatibilityReport {
            from_schema: from_schema.to_string(),
            to_schema: to_schema.to_string(),
            breaking_changes: breaking,
            warnings,
        })
    }

    /// Returns the number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn check_fields(schema: &Schema) -> Result<(), SchemaError> {
    for (name, spec) in &schema.fields {
        check_field(&schema.id, name, spec)?;
    }
    Ok(())
}

fn check_field(schema_id: &str, field: &str, spec: &FieldSpec) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidConstraint {
        schema_id: schema_id.to_string(),
        field: field.to_string(),
        reason,
    };

    let mut min = None;
    let mut max = None;
    let mut min_len = None;
    let mut max_len = None;

    for constraint in &spec.constraints {
        match constraint {
            Constraint::Min(v) | Constraint::Max(v) => {
                if !spec.field_type.is_numeric() {
                    return Err(invalid(format!(
                        "{} requires a numeric field, found {}",
                        constraint.rule(),
                        spec.field_type.describe()
                    )));
                }
                if v.is_nan() {
                    return Err(invalid("bound is NaN".to_string()));
                }
                if matches!(constraint, Constraint::Min(_)) {
                    min = Some(*v);
                } else {
                    max = Some(*v);
                }
            }
            Constraint::MinLength(n) | Constraint::MaxLength(n) => {
                if !spec.field_type.has_length() {
                    return Err(invalid(format!(
                        "{} requires a string or array field, found {}",
                        constraint.rule(),
                        spec.field_type.describe()
                    )));
                }
                if matches!(constraint, Constraint::MinLength(_)) {
                    min_len = Some(*n);
                } else {
                    max_len = Some(*n);
                }
            }
            Constraint::Pattern(pattern) => {
                if spec.field_type != FieldType::String {
                    return Err(invalid(format!(
                        "pattern requires a string field, found {}",
                        spec.field_type.describe()
                    )));
                }
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(SchemaError::InvalidPattern {
                        schema_id: schema_id.to_string(),
                        field: field.to_string(),
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            Constraint::OneOf(values) => {
                if values.is_empty() {
                    return Err(invalid("one_of needs at least one value".to_string()));
                }
            }
        }
    }

    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(invalid(format!("min {lo} is greater than max {hi}")));
        }
    }
    if let (Some(lo), Some(hi)) = (min_len, max_len) {
        if lo > hi {
            return Err(invalid(format!("min_length {lo} is greater than max_length {hi}")));
        }
    }
    Ok(())
}

/// Looks for a reference cycle reachable from `candidate`, treating it as
/// already registered (it may replace an existing definition).
fn find_cycle(candidate: &Schema, entries: &HashMap<String, SchemaEntry>) -> Option<Vec<String>> {
    fn visit(
        id: &str,
        candidate: &Schema,
        entries: &HashMap<String, SchemaEntry>,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(start) = path.iter().position(|p| p == id) {
            let mut cycle = path[start..].to_vec();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        if done.contains(id) {
            return None;
        }

        let references = if id == candidate.id {
            candidate.references()
        } else {
            entries.get(id)?.schema.references()
        };

        path.push(id.to_string());
        for reference in references {
            if let Some(cycle) = visit(&reference, candidate, entries, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(id.to_string());
        None
    }

    visit(&candidate.id, candidate, entries, &mut Vec::new(), &mut HashSet::new())
}
