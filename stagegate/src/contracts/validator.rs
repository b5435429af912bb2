//! Structural validation of artifact payloads against registered schemas.

use super::registry::SchemaRegistry;
use super::schema::{Constraint, FieldSpec, FieldType, Schema};
use crate::errors::ValidationError;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Validates JSON payloads against schemas held by a [`SchemaRegistry`].
///
/// Validation stops at the first failure. Paths use dotted field names and
/// bracketed indices, e.g. `steps[2].title`.
#[derive(Debug)]
pub struct ArtifactValidator {
    schemas: Arc<SchemaRegistry>,
    patterns: DashMap<String, Regex>,
}

impl ArtifactValidator {
    /// Creates a validator over the given schema registry.
    #[must_use]
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            patterns: DashMap::new(),
        }
    }

    /// Returns the schema registry backing this validator.
    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Validates `payload` against the schema `schema_id`.
    ///
    /// # Errors
    ///
    /// Returns the first structural failure found.
    pub fn validate(&self, schema_id: &str, payload: &Value) -> Result<(), ValidationError> {
        let schema = self
            .schemas
            .get(schema_id)
            .ok_or_else(|| ValidationError::UnknownSchema(schema_id.to_string()))?;
        self.check_object(&schema, payload, "")
    }

    fn check_object(&self, schema: &Schema, value: &Value, path: &str) -> Result<(), ValidationError> {
        let Some(object) = value.as_object() else {
            return Err(ValidationError::TypeMismatch {
                field: display_path(path),
                expected: format!("schema({})", schema.id),
            });
        };

        for (name, spec) in &schema.fields {
            let field_path = join(path, name);
            match object.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ValidationError::MissingField(field_path));
                    }
                }
                Some(value) => self.check_field(spec, value, &field_path)?,
            }
        }

        if !schema.allow_unknown_fields {
            if let Some(unknown) = object.keys().find(|k| !schema.fields.contains_key(*k)) {
                return Err(ValidationError::UnknownField(join(path, unknown)));
            }
        }
        Ok(())
    }

    fn check_field(&self, spec: &FieldSpec, value: &Value, path: &str) -> Result<(), ValidationError> {
        self.check_type(&spec.field_type, value, path)?;
        for constraint in &spec.constraints {
            if !self.satisfies(constraint, value) {
                return Err(ValidationError::ConstraintViolation {
                    field: path.to_string(),
                    rule: constraint.rule(),
                });
            }
        }
        Ok(())
    }

    fn check_type(&self, field_type: &FieldType, value: &Value, path: &str) -> Result<(), ValidationError> {
        let matches = match field_type {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
            FieldType::Array { items } => {
                let Some(elements) = value.as_array() else {
                    return Err(mismatch(field_type, path));
                };
                for (index, element) in elements.iter().enumerate() {
                    self.check_type(items, element, &format!("{path}[{index}]"))?;
                }
                true
            }
            FieldType::Schema { id } => {
                let schema = self
                    .schemas
                    .get(id)
                    .ok_or_else(|| ValidationError::UnknownSchema(id.clone()))?;
                return self.check_object(&schema, value, path);
            }
        };

        if matches {
            Ok(())
        } else {
            Err(mismatch(field_type, path))
        }
    }

    fn satisfies(&self, constraint: &Constraint, value: &Value) -> bool {
        match constraint {
            Constraint::Min(min) => value.as_f64().is_some_and(|v| v >= *min),
            Constraint::Max(max) => value.as_f64().is_some_and(|v| v <= *max),
            Constraint::MinLength(min) => length(value).is_some_and(|len| len >= *min),
            Constraint::MaxLength(max) => length(value).is_some_and(|len| len <= *max),
            Constraint::OneOf(allowed) => allowed.contains(value),
            Constraint::Pattern(pattern) => {
                let Some(text) = value.as_str() else {
                    return false;
                };
                self.compiled(pattern).is_some_and(|re| re.is_match(text))
            }
        }
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(re) = self.patterns.get(pattern) {
            return Some(re.clone());
        }
        // Patterns are checked at registration, so this only fails for
        // schemas built around the registry.
        let re = Regex::new(pattern).ok()?;
        self.patterns.insert(pattern.to_string(), re.clone());
        Some(re)
    }
}

fn mismatch(field_type: &FieldType, path: &str) -> ValidationError {
    ValidationError::TypeMismatch {
        field: display_path(path),
        expected: field_type.describe(),
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn validator() -> ArtifactValidator {
        let schemas = Arc::new(SchemaRegistry::new());
        schemas
            .register(
                Schema::new("Step")
                    .field(
                        "title",
                        FieldSpec::required(FieldType::String).with_constraint(Constraint::MinLength(1)),
                    )
                    .field(
                        "estimate",
                        FieldSpec::optional(FieldType::Integer).with_constraint(Constraint::Min(0.0)),
                    ),
            )
            .unwrap();
        schemas
            .register(
                Schema::new("Plan")
                    .field("steps", FieldSpec::required(FieldType::array_of(FieldType::schema("Step"))))
                    .field(
                        "status",
                        FieldSpec::optional(FieldType::String)
                            .with_constraint(Constraint::OneOf(vec![json!("draft"), json!("final")])),
                    )
                    .field(
                        "ticket",
                        FieldSpec::optional(FieldType::String)
                            .with_constraint(Constraint::Pattern("^[A-Z]+-[0-9]+$".to_string())),
                    ),
            )
            .unwrap();
        schemas
            .register(Schema::new("Strict").field("a", FieldSpec::optional(FieldType::Any)).strict())
            .unwrap();
        ArtifactValidator::new(schemas)
    }

    #[test]
    fn test_valid_payload() {
        let v = validator();
        let payload = json!({
            "steps": [{"title": "one", "estimate": 3}, {"title": "two"}],
            "status": "draft",
            "ticket": "ABC-12",
            "extra": true
        });
        assert_eq!(v.validate("Plan", &payload), Ok(()));
    }

    #[test]
    fn test_unknown_schema() {
        let v = validator();
        assert_eq!(
            v.validate("Nope", &json!({})),
            Err(ValidationError::UnknownSchema("Nope".to_string()))
        );
    }

    #[test]
    fn test_missing_field_and_null() {
        let v = validator();
        assert_eq!(
            v.validate("Plan", &json!({})),
            Err(ValidationError::MissingField("steps".to_string()))
        );
        assert_eq!(
            v.validate("Plan", &json!({"steps": null})),
            Err(ValidationError::MissingField("steps".to_string()))
        );
        // Optional null is fine.
        assert_eq!(v.validate("Plan", &json!({"steps": [], "status": null})), Ok(()));
    }

    #[test]
    fn test_nested_paths() {
        let v = validator();
        let payload = json!({"steps": [{"title": "a"}, {"title": "b"}, {"estimate": 1}]});
        assert_eq!(
            v.validate("Plan", &payload),
            Err(ValidationError::MissingField("steps[2].title".to_string()))
        );

        let payload = json!({"steps": [{"title": 5}]});
        assert_eq!(
            v.validate("Plan", &payload),
            Err(ValidationError::TypeMismatch {
                field: "steps[0].title".to_string(),
                expected: "string".to_string(),
            })
        );
    }

    #[test]
    fn test_type_mismatch_on_array_and_root() {
        let v = validator();
        assert_eq!(
            v.validate("Plan", &json!({"steps": {}})),
            Err(ValidationError::TypeMismatch {
                field: "steps".to_string(),
                expected: "array<schema(Step)>".to_string(),
            })
        );
        assert_eq!(
            v.validate("Plan", &json!([1, 2])),
            Err(ValidationError::TypeMismatch {
                field: "$".to_string(),
                expected: "schema(Plan)".to_string(),
            })
        );
        assert!(v.validate("Plan", &json!({"steps": [{"title": "x", "estimate": 1.5}]})).is_err());
    }

    #[test]
    fn test_constraints() {
        let v = validator();
        assert_eq!(
            v.validate("Plan", &json!({"steps": [{"title": ""}]})),
            Err(ValidationError::ConstraintViolation {
                field: "steps[0].title".to_string(),
                rule: "min_length 1".to_string(),
            })
        );
        assert_eq!(
            v.validate("Plan", &json!({"steps": [{"title": "x", "estimate": -1}]})),
            Err(ValidationError::ConstraintViolation {
                field: "steps[0].estimate".to_string(),
                rule: "min 0".to_string(),
            })
        );
        assert!(matches!(
            v.validate("Plan", &json!({"steps": [], "status": "archived"})),
            Err(ValidationError::ConstraintViolation { .. })
        ));
        assert!(matches!(
            v.validate("Plan", &json!({"steps": [], "ticket": "abc"})),
            Err(ValidationError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn test_strict_schema_rejects_unknown() {
        let v = validator();
        assert_eq!(v.validate("Strict", &json!({"a": 1})), Ok(()));
        assert_eq!(
            v.validate("Strict", &json!({"a": 1, "b": 2})),
            Err(ValidationError::UnknownField("b".to_string()))
        );
    }

    #[test]
    fn test_pattern_cache_reused() {
        let v = validator();
        for _ in 0..3 {
            v.validate("Plan", &json!({"steps": [], "ticket": "A-1"})).unwrap();
        }
        assert_eq!(v.patterns.len(), 1);
    }
}
