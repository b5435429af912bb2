//! The handoff envelope and its contract checks.

use super::violation::ContractViolation;
use crate::core::{ArtifactKey, IssueReport, Outcome};
use crate::registry::ScopedRegistry;
use crate::routing::StageDefinition;
use serde::{Deserialize, Serialize};

/// What an adapter returns when it hands control back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffEnvelope {
    /// Success or failure.
    pub outcome: Outcome,
    /// Keys written during the invocation.
    #[serde(default)]
    pub produced_keys: Vec<ArtifactKey>,
    /// Why the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<IssueReport>,
}

impl HandoffEnvelope {
    /// A successful handoff listing the produced keys.
    #[must_use]
    pub fn success(produced_keys: impl IntoIterator<Item = ArtifactKey>) -> Self {
        Self {
            outcome: Outcome::Success,
            produced_keys: produced_keys.into_iter().collect(),
            issue: None,
        }
    }

    /// A failed handoff.
    #[must_use]
    pub fn failure(issue: IssueReport) -> Self {
        Self {
            outcome: Outcome::Failure,
            produced_keys: Vec::new(),
            issue: Some(issue),
        }
    }

    /// Adds a produced key.
    #[must_use]
    pub fn with_produced(mut self, key: ArtifactKey) -> Self {
        if !self.produced_keys.contains(&key) {
            self.produced_keys.push(key);
        }
        self
    }

    /// Returns true for a successful handoff.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Checks the envelope against the stage definition.
    ///
    /// `written` reports whether a key was actually written by the stage.
    ///
    /// # Errors
    ///
    /// Returns the first rule the envelope breaks.
    pub fn check(
        &self,
        stage: &StageDefinition,
        written: impl Fn(&ArtifactKey) -> bool,
    ) -> Result<(), ContractViolation> {
        for key in &self.produced_keys {
            if !stage.can_write(key) {
                return Err(ContractViolation::UndeclaredWrite {
                    stage: stage.id.clone(),
                    key: key.clone(),
                });
            }
            if !written(key) {
                return Err(ContractViolation::UnwrittenProducedKey {
                    stage: stage.id.clone(),
                    key: key.clone(),
                });
            }
        }

        match self.outcome {
            Outcome::Success => {
                if let Some(key) = stage
                    .mandatory_writes()
                    .find(|k| !self.produced_keys.contains(*k))
                {
                    return Err(ContractViolation::MissingMandatoryWrite {
                        stage: stage.id.clone(),
                        key: key.clone(),
                    });
                }
            }
            Outcome::Failure => {
                if self.issue.is_none() {
                    return Err(ContractViolation::MissingIssueReport {
                        stage: stage.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks the envelope and the invocation's access log together.
    ///
    /// Recorded scope violations and rejected payloads take precedence over
    /// envelope rules.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn verify_invocation(&self, stage: &StageDefinition, scope: &ScopedRegistry) -> Result<(), ContractViolation> {
        if let Some(violation) = scope.violations().into_iter().next() {
            return Err(ContractViolation::ScopeViolation {
                stage: stage.id.clone(),
                key: violation.key,
                access: violation.access,
            });
        }
        if let Some(rejected) = scope.rejected_writes().into_iter().next() {
            return Err(ContractViolation::InvalidPayload {
                stage: stage.id.clone(),
                key: rejected.key,
                reason: rejected.reason,
            });
        }
        self.check(stage, |key| scope.has_written(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{FieldSpec, FieldType, Schema, SchemaRegistry};
    use crate::core::IssueCategory;
    use crate::registry::TypeRegistry;
    use crate::store::InMemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn key(s: &str) -> ArtifactKey {
        s.parse().unwrap()
    }

    fn stage() -> StageDefinition {
        StageDefinition::work("plan")
            .writes(key("type:Plan"), "Doc")
            .writes_optional(key("type:Notes"), "Doc")
    }

    #[test]
    fn test_success_with_mandatory_keys() {
        let env = HandoffEnvelope::success([key("type:Plan")]);
        assert_eq!(env.check(&stage(), |_| true), Ok(()));
    }

    #[test]
    fn test_missing_mandatory_write() {
        let env = HandoffEnvelope::success([key("type:Notes")]);
        assert_eq!(
            env.check(&stage(), |_| true),
            Err(ContractViolation::MissingMandatoryWrite {
                stage: "plan".to_string(),
                key: key("type:Plan"),
            })
        );
    }

    #[test]
    fn test_listed_but_unwritten() {
        let env = HandoffEnvelope::success([key("type:Plan")]);
        assert!(matches!(
            env.check(&stage(), |_| false),
            Err(ContractViolation::UnwrittenProducedKey { .. })
        ));
    }

    #[test]
    fn test_undeclared_key() {
        let env = HandoffEnvelope::success([key("type:Plan")]).with_produced(key("type:Other"));
        assert!(matches!(
            env.check(&stage(), |_| true),
            Err(ContractViolation::UndeclaredWrite { .. })
        ));
    }

    #[test]
    fn test_failure_requires_issue() {
        let mut env = HandoffEnvelope::failure(IssueReport::new(IssueCategory::Incomplete, "x"));
        assert_eq!(env.check(&stage(), |_| false), Ok(()));

        env.issue = None;
        assert_eq!(
            env.check(&stage(), |_| false),
            Err(ContractViolation::MissingIssueReport {
                stage: "plan".to_string()
            })
        );
    }

    #[test]
    fn test_envelope_json_shape() {
        let env: HandoffEnvelope = serde_json::from_value(json!({
            "outcome": "failure",
            "issue": {"category": "validation", "summary": "bad plan", "required_stage": "plan"}
        }))
        .unwrap();
        assert!(!env.is_success());
        assert!(env.produced_keys.is_empty());
        assert_eq!(env.issue.unwrap().required_stage.as_deref(), Some("plan"));
    }

    #[tokio::test]
    async fn test_verify_invocation_uses_scope_log() {
        let schemas = Arc::new(SchemaRegistry::new());
        schemas
            .register(Schema::new("Doc").field("body", FieldSpec::required(FieldType::String)))
            .unwrap();
        let registry = Arc::new(TypeRegistry::new(Arc::new(InMemoryBackend::new()), schemas));
        let def = stage();
        let scope = ScopedRegistry::new(
            registry,
            "wf/x",
            "plan",
            Vec::new(),
            def.write_set.iter().map(|w| (w.key.clone(), w.schema_id.clone())),
        );

        let env = HandoffEnvelope::success([key("type:Plan")]);
        assert!(matches!(
            env.verify_invocation(&def, &scope),
            Err(ContractViolation::UnwrittenProducedKey { .. })
        ));

        scope.put(&key("type:Plan"), json!({"body": "p"})).await.unwrap();
        assert_eq!(env.verify_invocation(&def, &scope), Ok(()));

        let _ = scope.put(&key("type:Notes"), json!({"body": 1})).await;
        assert!(matches!(
            env.verify_invocation(&def, &scope),
            Err(ContractViolation::InvalidPayload { .. })
        ));

        let _ = scope.get(&key("type:Secret")).await;
        assert!(matches!(
            env.verify_invocation(&def, &scope),
            Err(ContractViolation::ScopeViolation { .. })
        ));
    }
}
