//! Stage definitions and transitions.

use crate::core::{ArtifactKey, IssueReport, Outcome, StageKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Textual form of [`Transition::Completed`].
pub const COMPLETED_MARKER: &str = "$completed";

/// Textual form of [`Transition::Failed`].
pub const FAILED_MARKER: &str = "$failed";

/// Where a stage hands control after it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transition {
    /// Run another stage.
    Stage(String),
    /// Terminal success marker.
    Completed,
    /// Terminal business-failure marker.
    Failed,
}

impl Transition {
    /// Shorthand for a stage target.
    #[must_use]
    pub fn stage(id: impl Into<String>) -> Self {
        Self::Stage(id.into())
    }

    /// Returns the target stage id, if this is not a terminal marker.
    #[must_use]
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::Stage(id) => Some(id),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Returns true for the terminal markers.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Stage(_))
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(id) => write!(f, "{id}"),
            Self::Completed => write!(f, "{COMPLETED_MARKER}"),
            Self::Failed => write!(f, "{FAILED_MARKER}"),
        }
    }
}

impl From<String> for Transition {
    fn from(value: String) -> Self {
        match value.as_str() {
            COMPLETED_MARKER => Self::Completed,
            FAILED_MARKER => Self::Failed,
            _ => Self::Stage(value),
        }
    }
}

impl From<&str> for Transition {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Transition> for String {
    fn from(value: Transition) -> Self {
        value.to_string()
    }
}

fn default_true() -> bool {
    true
}

/// An artifact a stage may read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSpec {
    /// The artifact key.
    pub key: ArtifactKey,
    /// Whether the stage cannot start without it.
    #[serde(default = "default_true")]
    pub required: bool,
}

/// An artifact a stage may write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSpec {
    /// The artifact key.
    pub key: ArtifactKey,
    /// Schema the payload must satisfy.
    pub schema_id: String,
    /// Whether a successful handoff must include it.
    #[serde(default = "default_true")]
    pub mandatory: bool,
}

/// Declaration of one stage in the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage id.
    pub id: String,
    /// Work or gate.
    #[serde(default)]
    pub kind: StageKind,
    /// Artifacts the stage may read.
    #[serde(default)]
    pub read_set: Vec<ReadSpec>,
    /// Artifacts the stage may write.
    #[serde(default)]
    pub write_set: Vec<WriteSpec>,
    /// Next stage on success.
    #[serde(default = "default_on_success")]
    pub on_success: Transition,
    /// Next stage on failure.
    #[serde(default = "default_on_failure")]
    pub on_failure: Transition,
    /// Stages a failure may be routed to when the issue names them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediation_targets: Vec<String>,
    /// Per-stage invocation timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Per-stage retry ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_on_success() -> Transition {
    Transition::Completed
}

fn default_on_failure() -> Transition {
    Transition::Failed
}

impl StageDefinition {
    /// Creates a stage of the given kind that completes on success and
    /// fails the run on failure.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            read_set: Vec::new(),
            write_set: Vec::new(),
            on_success: Transition::Completed,
            on_failure: Transition::Failed,
            remediation_targets: Vec::new(),
            timeout_ms: None,
            max_retries: None,
        }
    }

    /// Creates a work stage.
    #[must_use]
    pub fn work(id: impl Into<String>) -> Self {
        Self::new(id, StageKind::Work)
    }

    /// Creates a gate stage.
    #[must_use]
    pub fn gate(id: impl Into<String>) -> Self {
        Self::new(id, StageKind::Gate)
    }

    /// Declares a required input.
    #[must_use]
    pub fn reads(mut self, key: ArtifactKey) -> Self {
        self.read_set.push(ReadSpec { key, required: true });
        self
    }

    /// Declares an optional input.
    #[must_use]
    pub fn reads_optional(mut self, key: ArtifactKey) -> Self {
        self.read_set.push(ReadSpec { key, required: false });
        self
    }

    /// Declares a mandatory output.
    #[must_use]
    pub fn writes(mut self, key: ArtifactKey, schema_id: impl Into<String>) -> Self {
        self.write_set.push(WriteSpec {
            key,
            schema_id: schema_id.into(),
            mandatory: true,
        });
        self
    }

    /// Declares an optional output.
    #[must_use]
    pub fn writes_optional(mut self, key: ArtifactKey, schema_id: impl Into<String>) -> Self {
        self.write_set.push(WriteSpec {
            key,
            schema_id: schema_id.into(),
            mandatory: false,
        });
        self
    }

    /// Sets the success transition.
    #[must_use]
    pub fn on_success(mut self, next: impl Into<Transition>) -> Self {
        self.on_success = next.into();
        self
    }

    /// Sets the failure transition.
    #[must_use]
    pub fn on_failure(mut self, next: impl Into<Transition>) -> Self {
        self.on_failure = next.into();
        self
    }

    /// Allows failures to be routed to `stage` when the issue names it.
    #[must_use]
    pub fn with_remediation_target(mut self, stage: impl Into<String>) -> Self {
        self.remediation_targets.push(stage.into());
        self
    }

    /// Overrides the invocation timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Overrides the retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Resolves the next transition for an outcome.
    ///
    /// A failure whose issue names a listed remediation target goes there;
    /// any other failure follows `on_failure`.
    #[must_use]
    pub fn next(&self, outcome: Outcome, issue: Option<&IssueReport>) -> Transition {
        match outcome {
            Outcome::Success => self.on_success.clone(),
            Outcome::Failure => issue
                .and_then(|i| i.required_stage.as_ref())
                .filter(|stage| self.remediation_targets.contains(*stage))
                .map_or_else(|| self.on_failure.clone(), |stage| Transition::Stage(stage.clone())),
        }
    }

    /// Keys the stage needs before it can start.
    pub fn required_reads(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.read_set.iter().filter(|r| r.required).map(|r| &r.key)
    }

    /// Keys a successful handoff must produce.
    pub fn mandatory_writes(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.write_set.iter().filter(|w| w.mandatory).map(|w| &w.key)
    }

    /// Declared schema for a writable key.
    #[must_use]
    pub fn write_schema(&self, key: &ArtifactKey) -> Option<&str> {
        self.write_set
            .iter()
            .find(|w| &w.key == key)
            .map(|w| w.schema_id.as_str())
    }

    /// Returns true if the key is in the write set.
    #[must_use]
    pub fn can_write(&self, key: &ArtifactKey) -> bool {
        self.write_schema(key).is_some()
    }

    /// Every stage this one can hand control to.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.on_success
            .stage_id()
            .into_iter()
            .chain(self.on_failure.stage_id())
            .chain(self.remediation_targets.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IssueCategory;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key(s: &str) -> ArtifactKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_transition_text_form() {
        assert_eq!(Transition::from("$completed"), Transition::Completed);
        assert_eq!(Transition::from("$failed"), Transition::Failed);
        assert_eq!(Transition::from("review"), Transition::stage("review"));
        assert_eq!(serde_json::to_value(Transition::Completed).unwrap(), json!("$completed"));
        assert!(Transition::Failed.is_terminal());
        assert_eq!(Transition::stage("x").stage_id(), Some("x"));
    }

    #[test]
    fn test_builder_defaults() {
        let stage = StageDefinition::work("plan");
        assert_eq!(stage.kind, StageKind::Work);
        assert_eq!(stage.on_success, Transition::Completed);
        assert_eq!(stage.on_failure, Transition::Failed);
        assert!(stage.timeout_ms.is_none());
    }

    #[test]
    fn test_read_and_write_sets() {
        let stage = StageDefinition::work("plan")
            .reads(key("type:Request"))
            .reads_optional(key("type:Hint"))
            .writes(key("type:Plan"), "Plan")
            .writes_optional(key("type:Notes"), "Notes");

        let required: Vec<_> = stage.required_reads().cloned().collect();
        assert_eq!(required, vec![key("type:Request")]);
        let mandatory: Vec<_> = stage.mandatory_writes().cloned().collect();
        assert_eq!(mandatory, vec![key("type:Plan")]);
        assert_eq!(stage.write_schema(&key("type:Notes")), Some("Notes"));
        assert!(!stage.can_write(&key("type:Request")));
    }

    #[test]
    fn test_next_follows_edges() {
        let stage = StageDefinition::gate("review")
            .on_success(Transition::Completed)
            .on_failure("plan");

        assert_eq!(stage.next(Outcome::Success, None), Transition::Completed);
        assert_eq!(stage.next(Outcome::Failure, None), Transition::stage("plan"));
    }

    #[test]
    fn test_next_uses_listed_remediation_target() {
        let stage = StageDefinition::gate("review")
            .on_failure("plan")
            .with_remediation_target("design");

        let to_design = IssueReport::new(IssueCategory::Validation, "bad design").with_required_stage("design");
        assert_eq!(stage.next(Outcome::Failure, Some(&to_design)), Transition::stage("design"));

        // Unlisted targets fall back to on_failure.
        let to_other = IssueReport::new(IssueCategory::Validation, "x").with_required_stage("intake");
        assert_eq!(stage.next(Outcome::Failure, Some(&to_other)), Transition::stage("plan"));

        // Success ignores the issue.
        assert_eq!(stage.next(Outcome::Success, Some(&to_design)), Transition::Completed);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let stage: StageDefinition = serde_json::from_value(json!({
            "id": "plan",
            "read_set": [{"key": "type:Request"}],
            "write_set": [{"key": "type:Plan", "schema_id": "Plan", "mandatory": false}],
            "on_success": "review"
        }))
        .unwrap();

        assert!(stage.read_set[0].required);
        assert!(!stage.write_set[0].mandatory);
        assert_eq!(stage.on_success, Transition::stage("review"));
        assert_eq!(stage.on_failure, Transition::Failed);
    }

    #[test]
    fn test_targets() {
        let stage = StageDefinition::gate("review")
            .on_success(Transition::Completed)
            .on_failure("plan")
            .with_remediation_target("design");
        let targets: Vec<_> = stage.targets().collect();
        assert_eq!(targets, vec!["plan", "design"]);
    }
}
