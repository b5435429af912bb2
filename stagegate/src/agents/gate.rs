//! Gate stages: read inputs, apply a policy, pass or send the run back.

use super::adapter::{AgentAdapter, Invocation};
use crate::core::{Artifact, ArtifactKey, IssueCategory, IssueReport};
use crate::handoff::HandoffEnvelope;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Artifacts a gate read, keyed by artifact key.
#[derive(Debug, Clone, Default)]
pub struct GateInputs {
    artifacts: BTreeMap<ArtifactKey, Artifact>,
}

impl GateInputs {
    /// Wraps a set of artifacts.
    #[must_use]
    pub fn new(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        Self {
            artifacts: artifacts.into_iter().map(|a| (a.key.clone(), a)).collect(),
        }
    }

    /// Looks up an artifact.
    #[must_use]
    pub fn get(&self, key: &ArtifactKey) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    /// Looks up an artifact payload.
    #[must_use]
    pub fn payload(&self, key: &ArtifactKey) -> Option<&Value> {
        self.get(key).map(|a| &a.payload)
    }

    /// Keys of every input.
    pub fn keys(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.artifacts.keys()
    }
}

/// Verdict of a gate policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Let the run move forward.
    Pass,
    /// Send the run back with an explanation.
    Reject(IssueReport),
}

/// Decision logic of a gate stage.
pub trait GatePolicy: Send + Sync {
    /// Evaluates the inputs.
    fn evaluate(&self, inputs: &GateInputs) -> GateDecision;
}

/// Passes when every listed field of an artifact is present and non-empty.
///
/// Fields may be dotted paths into nested objects (`plan.summary`).
#[derive(Debug, Clone)]
pub struct RequiredFieldsPolicy {
    key: ArtifactKey,
    fields: Vec<String>,
    required_stage: Option<String>,
}

impl RequiredFieldsPolicy {
    /// Checks `fields` on the artifact stored under `key`.
    #[must_use]
    pub fn new(key: ArtifactKey, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key,
            fields: fields.into_iter().map(Into::into).collect(),
            required_stage: None,
        }
    }

    /// Names the stage that must fix a rejection.
    #[must_use]
    pub fn with_required_stage(mut self, stage: impl Into<String>) -> Self {
        self.required_stage = Some(stage.into());
        self
    }
}

impl GatePolicy for RequiredFieldsPolicy {
    fn evaluate(&self, inputs: &GateInputs) -> GateDecision {
        let Some(payload) = inputs.payload(&self.key) else {
            return GateDecision::Reject(self.reject(format!("Artifact '{}' was not provided", self.key)));
        };

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| lookup(payload, field).map_or(true, is_empty))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            GateDecision::Pass
        } else {
            GateDecision::Reject(self.reject(format!(
                "Artifact '{}' is missing or has empty fields: {}",
                self.key,
                missing.join(", ")
            )))
        }
    }
}

impl RequiredFieldsPolicy {
    fn reject(&self, summary: String) -> IssueReport {
        let issue = IssueReport::new(IssueCategory::Incomplete, summary).with_evidence(self.key.clone());
        match &self.required_stage {
            Some(stage) => issue.with_required_stage(stage.clone()),
            None => issue,
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Passes when a closure over the inputs returns true.
pub struct PredicatePolicy<F>
where
    F: Fn(&GateInputs) -> bool + Send + Sync,
{
    predicate: F,
    summary: String,
    category: IssueCategory,
    required_stage: Option<String>,
}

impl<F> PredicatePolicy<F>
where
    F: Fn(&GateInputs) -> bool + Send + Sync,
{
    /// Rejects with `summary` whenever `predicate` returns false.
    pub fn new(summary: impl Into<String>, predicate: F) -> Self {
        Self {
            predicate,
            summary: summary.into(),
            category: IssueCategory::Validation,
            required_stage: None,
        }
    }

    /// Sets the category of rejections.
    #[must_use]
    pub fn with_category(mut self, category: IssueCategory) -> Self {
        self.category = category;
        self
    }

    /// Names the stage that must fix a rejection.
    #[must_use]
    pub fn with_required_stage(mut self, stage: impl Into<String>) -> Self {
        self.required_stage = Some(stage.into());
        self
    }
}

impl<F> Debug for PredicatePolicy<F>
where
    F: Fn(&GateInputs) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicatePolicy")
            .field("summary", &self.summary)
            .field("required_stage", &self.required_stage)
            .finish_non_exhaustive()
    }
}

impl<F> GatePolicy for PredicatePolicy<F>
where
    F: Fn(&GateInputs) -> bool + Send + Sync,
{
    fn evaluate(&self, inputs: &GateInputs) -> GateDecision {
        if (self.predicate)(inputs) {
            return GateDecision::Pass;
        }
        let issue = IssueReport::new(self.category.clone(), self.summary.clone())
            .with_evidence_refs(inputs.keys().cloned());
        GateDecision::Reject(match &self.required_stage {
            Some(stage) => issue.with_required_stage(stage.clone()),
            None => issue,
        })
    }
}

/// Adapter that reads its whole read set and applies a [`GatePolicy`].
///
/// Missing inputs fail the gate with an `incomplete` issue before the
/// policy runs.
pub struct GateAdapter<P: GatePolicy> {
    policy: P,
    remediation_stage: Option<String>,
}

impl<P: GatePolicy> GateAdapter<P> {
    /// Creates a gate around a policy.
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            remediation_stage: None,
        }
    }

    /// Stage named on rejections whose policy did not name one.
    #[must_use]
    pub fn with_remediation_stage(mut self, stage: impl Into<String>) -> Self {
        self.remediation_stage = Some(stage.into());
        self
    }

    fn finish(&self, issue: IssueReport) -> IssueReport {
        match (&issue.required_stage, &self.remediation_stage) {
            (None, Some(stage)) => issue.with_required_stage(stage.clone()),
            _ => issue,
        }
    }
}

impl<P: GatePolicy> Debug for GateAdapter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateAdapter")
            .field("remediation_stage", &self.remediation_stage)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<P: GatePolicy> AgentAdapter for GateAdapter<P> {
    async fn run(&self, invocation: &Invocation) -> HandoffEnvelope {
        let mut artifacts = Vec::new();
        let mut missing = Vec::new();

        for spec in &invocation.read_set {
            match invocation.registry.get_optional(&spec.key).await {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => missing.push(spec.key.clone()),
                Err(e) => {
                    let issue = IssueReport::new(IssueCategory::Incomplete, format!("Could not read '{}': {e}", spec.key))
                        .with_evidence(spec.key.clone());
                    return HandoffEnvelope::failure(self.finish(issue));
                }
            }
        }

        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            let issue = IssueReport::new(
                IssueCategory::Incomplete,
                format!("Gate '{}' is missing inputs: {}", invocation.stage_id, names.join(", ")),
            )
            .with_evidence_refs(missing);
            return HandoffEnvelope::failure(self.finish(issue));
        }

        match self.policy.evaluate(&GateInputs::new(artifacts)) {
            GateDecision::Pass => {
                debug!(stage = %invocation.stage_id, "Gate passed");
                HandoffEnvelope::success(Vec::new())
            }
            GateDecision::Reject(issue) => {
                debug!(stage = %invocation.stage_id, issue = %issue, "Gate rejected");
                HandoffEnvelope::failure(self.finish(issue))
            }
        }
    }
}
