//! Declarative schema model for artifact payloads.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The JSON type a field must have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// A JSON string.
    String,
    /// A JSON number without a fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// A JSON boolean.
    Boolean,
    /// Any JSON object.
    Object,
    /// A JSON array whose elements all have `items` type.
    Array {
        /// Element type.
        items: Box<FieldType>,
    },
    /// Any JSON value.
    Any,
    /// An object validated against another registered schema.
    Schema {
        /// The nested schema id.
        id: String,
    },
}

impl FieldType {
    /// Shorthand for an array of `items`.
    #[must_use]
    pub fn array_of(items: Self) -> Self {
        Self::Array {
            items: Box::new(items),
        }
    }

    /// Shorthand for a nested schema reference.
    #[must_use]
    pub fn schema(id: impl Into<String>) -> Self {
        Self::Schema { id: id.into() }
    }

    /// Human-readable name used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Number => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Object => "object".to_string(),
            Self::Array { items } => format!("array<{}>", items.describe()),
            Self::Any => "any".to_string(),
            Self::Schema { id } => format!("schema({id})"),
        }
    }

    fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Array { items } => items.collect_references(out),
            Self::Schema { id } => {
                out.insert(id.clone());
            }
            _ => {}
        }
    }

    pub(crate) fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Number)
    }

    pub(crate) fn has_length(&self) -> bool {
        matches!(self, Self::String | Self::Array { .. })
    }
}

/// A declarative constraint on a field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Inclusive numeric lower bound.
    Min(f64),
    /// Inclusive numeric upper bound.
    Max(f64),
    /// Minimum string length (chars) or array length.
    MinLength(usize),
    /// Maximum string length (chars) or array length.
    MaxLength(usize),
    /// Regular expression a string must match.
    Pattern(String),
    /// Enumeration of allowed values.
    OneOf(Vec<serde_json::Value>),
}

impl Constraint {
    /// Short description used in violation messages.
    #[must_use]
    pub fn rule(&self) -> String {
        match self {
            Self::Min(v) => format!("min {v}"),
            Self::Max(v) => format!("max {v}"),
            Self::MinLength(v) => format!("min_length {v}"),
            Self::MaxLength(v) => format!("max_length {v}"),
            Self::Pattern(p) => format!("pattern {p}"),
            Self::OneOf(values) => format!(
                "one_of [{}]",
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Declaration of one field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// The field's type.
    #[serde(flatten)]
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    #[serde(default)]
    pub required: bool,
    /// Additional value constraints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl FieldSpec {
    /// A required field of the given type.
    #[must_use]
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            constraints: Vec::new(),
        }
    }

    /// An optional field of the given type.
    #[must_use]
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            constraints: Vec::new(),
        }
    }

    /// Adds a constraint.
    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

fn default_allow_unknown() -> bool {
    true
}

/// A named contract for one artifact kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Unique schema id.
    pub id: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared fields, keyed by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Whether undeclared fields are tolerated.
    #[serde(default = "default_allow_unknown")]
    pub allow_unknown_fields: bool,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            fields: BTreeMap::new(),
            allow_unknown_fields: true,
        }
    }

    /// Adds a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Rejects undeclared fields.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.allow_unknown_fields = false;
        self
    }

    /// Ids of every schema this one references directly.
    #[must_use]
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for spec in self.fields.values() {
            spec.field_type.collect_references(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_builder_and_references() {
        let schema = Schema::new("Plan")
            .field("title", FieldSpec::required(FieldType::String))
            .field("steps", FieldSpec::required(FieldType::array_of(FieldType::schema("Step"))))
            .field("owner", FieldSpec::optional(FieldType::schema("Person")));

        let refs: Vec<_> = schema.references().into_iter().collect();
        assert_eq!(refs, vec!["Person".to_string(), "Step".to_string()]);
        assert!(schema.allow_unknown_fields);
        assert!(!schema.clone().strict().allow_unknown_fields);
    }

    #[test]
    fn test_schema_from_json() {
        let schema: Schema = serde_json::from_value(json!({
            "id": "Request",
            "fields": {
                "goal": {"type": "string", "required": true, "constraints": [{"min_length": 1}]},
                "priority": {"type": "integer", "constraints": [{"min": 0}, {"max": 5}]},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        }))
        .unwrap();

        assert_eq!(schema.fields.len(), 3);
        assert!(schema.fields["goal"].required);
        assert_eq!(schema.fields["priority"].constraints, vec![Constraint::Min(0.0), Constraint::Max(5.0)]);
        assert_eq!(schema.fields["tags"].field_type, FieldType::array_of(FieldType::String));
        assert!(schema.allow_unknown_fields);
    }

    #[test]
    fn test_describe_and_rule() {
        assert_eq!(FieldType::array_of(FieldType::schema("Step")).describe(), "array<schema(Step)>");
        assert_eq!(Constraint::MinLength(2).rule(), "min_length 2");
        assert_eq!(Constraint::OneOf(vec![json!("a"), json!(1)]).rule(), r#"one_of ["a", 1]"#);
    }
}
