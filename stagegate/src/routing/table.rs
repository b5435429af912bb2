//! The validated routing table.

use super::stage::{StageDefinition, Transition};
use crate::core::{ArtifactKey, IssueReport, Outcome, SEED_PRODUCER};
use crate::errors::{codes, ContractErrorInfo, CycleDetectedError, RoutingValidationError, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// An artifact the operator supplies when a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedKey {
    /// The artifact key.
    pub key: ArtifactKey,
    /// Schema the seed payload must satisfy.
    pub schema_id: String,
}

/// Serialized shape of a routing table, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTableDef {
    /// Default entry stage.
    pub entry: String,
    /// Keys supplied at start.
    #[serde(default)]
    pub seed_keys: Vec<SeedKey>,
    /// Stage declarations, in order.
    pub stages: Vec<StageDefinition>,
}

/// Declarative stage graph owned by the coordinator.
///
/// Construction validates the graph; a `RoutingTable` value is always
/// well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RoutingTableDef", into = "RoutingTableDef")]
pub struct RoutingTable {
    entry: String,
    seed_keys: Vec<SeedKey>,
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
}

impl RoutingTable {
    /// Starts a builder with the given entry stage.
    #[must_use]
    pub fn builder(entry: impl Into<String>) -> RoutingTableBuilder {
        RoutingTableBuilder::new(entry)
    }

    /// Parses and validates a table from JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON and a routing error
    /// when the graph is invalid.
    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        let def: RoutingTableDef = serde_json::from_str(json)?;
        Ok(Self::try_from(def)?)
    }

    /// Serializes the table to pretty JSON.
    pub fn to_json(&self) -> Result<String, WorkflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The default entry stage.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Keys supplied by the operator at start.
    #[must_use]
    pub fn seed_keys(&self) -> &[SeedKey] {
        &self.seed_keys
    }

    /// Declared schema of a seed key.
    #[must_use]
    pub fn seed_schema(&self, key: &ArtifactKey) -> Option<&str> {
        self.seed_keys
            .iter()
            .find(|s| &s.key == key)
            .map(|s| s.schema_id.as_str())
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Returns true if the stage exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a validated table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Resolves the transition out of `stage` for an outcome.
    #[must_use]
    pub fn next(&self, stage: &str, outcome: Outcome, issue: Option<&IssueReport>) -> Option<Transition> {
        self.stage(stage).map(|s| s.next(outcome, issue))
    }

    /// Stage ids visited when every stage succeeds, starting at `from`.
    #[must_use]
    pub fn success_path(&self, from: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self.stage(from);
        while let Some(stage) = current {
            path.push(stage.id.clone());
            current = stage.on_success.stage_id().and_then(|id| self.stage(id));
        }
        path
    }

    /// Every schema id named by a seed key or write set.
    #[must_use]
    pub fn schema_ids(&self) -> BTreeSet<String> {
        self.seed_keys
            .iter()
            .map(|s| s.schema_id.clone())
            .chain(
                self.stages
                    .iter()
                    .flat_map(|s| s.write_set.iter().map(|w| w.schema_id.clone())),
            )
            .collect()
    }
}

impl TryFrom<RoutingTableDef> for RoutingTable {
    type Error = RoutingValidationError;

    fn try_from(def: RoutingTableDef) -> Result<Self, Self::Error> {
        let mut builder = RoutingTableBuilder::new(def.entry);
        builder.seed_keys = def.seed_keys;
        builder.stages = def.stages;
        builder.build()
    }
}

impl From<RoutingTable> for RoutingTableDef {
    fn from(table: RoutingTable) -> Self {
        Self {
            entry: table.entry,
            seed_keys: table.seed_keys,
            stages: table.stages,
        }
    }
}

/// Builder for validated routing tables.
#[derive(Debug, Clone)]
pub struct RoutingTableBuilder {
    entry: String,
    seed_keys: Vec<SeedKey>,
    stages: Vec<StageDefinition>,
}

impl RoutingTableBuilder {
    /// Creates a builder with the given entry stage.
    #[must_use]
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            seed_keys: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Declares a seed key.
    #[must_use]
    pub fn seed(mut self, key: ArtifactKey, schema_id: impl Into<String>) -> Self {
        self.seed_keys.push(SeedKey {
            key,
            schema_id: schema_id.into(),
        });
        self
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validates the graph and builds the table.
    ///
    /// # Errors
    ///
    /// Returns the first rule the graph breaks, with a stable error code.
    pub fn build(self) -> Result<RoutingTable, RoutingValidationError> {
        if self.stages.is_empty() {
            return Err(RoutingValidationError::new("Routing table has no stages").with_error_info(
                ContractErrorInfo::new(codes::EMPTY, "Cannot build an empty routing table")
                    .with_fix_hint("Add at least one stage before building."),
            ));
        }

        let mut index = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.id.trim().is_empty() {
                return Err(RoutingValidationError::new("Stage id cannot be empty").with_error_info(
                    ContractErrorInfo::new(codes::INVALID_STAGE, "Blank stage id")
                        .with_fix_hint("Give every stage a non-empty id."),
                ));
            }
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(
                    RoutingValidationError::new(format!("Duplicate stage id '{}'", stage.id))
                        .with_stages(vec![stage.id.clone()])
                        .with_error_info(
                            ContractErrorInfo::new(codes::INVALID_STAGE, format!("Stage '{}' is declared twice", stage.id))
                                .with_fix_hint("Stage ids must be unique within a routing table."),
                        ),
                );
            }
        }

        let table = RoutingTable {
            entry: self.entry,
            seed_keys: self.seed_keys,
            stages: self.stages,
            index,
        };

        if !table.contains(&table.entry) {
            return Err(unknown_target(&table.entry, "entry", &table.entry));
        }

        for stage in &table.stages {
            if let Transition::Stage(target) = &stage.on_success {
                if !table.contains(target) {
                    return Err(unknown_target(&stage.id, "on_success", target));
                }
            }
            match &stage.on_failure {
                Transition::Stage(target) if !table.contains(target) => {
                    return Err(unknown_target(&stage.id, "on_failure", target));
                }
                Transition::Completed => {
                    return Err(RoutingValidationError::new(format!(
                        "Stage '{}' routes failures to the success marker",
                        stage.id
                    ))
                    .with_stages(vec![stage.id.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::FAILURE_TO_SUCCESS, "on_failure cannot be $completed")
                            .with_fix_hint("Route failures to a remediation stage or to $failed."),
                    ));
                }
                _ => {}
            }
            for target in &stage.remediation_targets {
                if !table.contains(target) {
                    return Err(unknown_target(&stage.id, "remediation_targets", target));
                }
            }
        }

        check_ownership(&table)?;

        if let Some(cycle) = find_success_cycle(&table) {
            return Err(CycleDetectedError::new(cycle).into());
        }

        let reachable = reachable_from(&table, &table.entry);
        let unreachable: Vec<String> = table
            .stages
            .iter()
            .filter(|s| !reachable.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(RoutingValidationError::new(format!(
                "Stages not reachable from entry '{}': {}",
                table.entry,
                unreachable.join(", ")
            ))
            .with_stages(unreachable)
            .with_error_info(
                ContractErrorInfo::new(codes::UNREACHABLE, "Some stages can never run")
                    .with_context_entry("entry", table.entry.clone())
                    .with_fix_hint("Remove the stages or add a transition that leads to them."),
            ));
        }

        let completes = table
            .stages
            .iter()
            .any(|s| reachable.contains(s.id.as_str()) && s.on_success == Transition::Completed);
        if !completes {
            return Err(RoutingValidationError::new(format!(
                "No path from entry '{}' reaches $completed",
                table.entry
            ))
            .with_stages(vec![table.entry.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::NO_COMPLETION, "The run can never complete")
                    .with_fix_hint("Give at least one reachable stage on_success = $completed."),
            ));
        }

        let produced: HashSet<&ArtifactKey> = table
            .seed_keys
            .iter()
            .map(|s| &s.key)
            .chain(table.stages.iter().flat_map(|s| s.write_set.iter().map(|w| &w.key)))
            .collect();
        for stage in &table.stages {
            if let Some(key) = stage.required_reads().find(|k| !produced.contains(k)) {
                return Err(RoutingValidationError::new(format!(
                    "Stage '{}' requires '{}', which no stage writes and no seed supplies",
                    stage.id, key
                ))
                .with_stages(vec![stage.id.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::UNPRODUCED_READ, format!("Required input '{key}' is never produced"))
                        .with_context_entry("key", key.to_string())
                        .with_fix_hint("Declare the key as a seed, add it to a write set, or mark the read optional."),
                ));
            }
        }

        Ok(table)
    }
}

/// Every key has one writer: the seed, or a single stage with a single schema.
fn check_ownership(table: &RoutingTable) -> Result<(), RoutingValidationError> {
    let mut owners: HashMap<&ArtifactKey, (&str, &str)> = HashMap::new();
    let claims = table
        .seed_keys
        .iter()
        .map(|s| (&s.key, SEED_PRODUCER, s.schema_id.as_str()))
        .chain(table.stages.iter().flat_map(|stage| {
            stage
                .write_set
                .iter()
                .map(move |w| (&w.key, stage.id.as_str(), w.schema_id.as_str()))
        }));

    for (key, owner, schema_id) in claims {
        match owners.get(key) {
            None => {
                owners.insert(key, (owner, schema_id));
            }
            Some(&claim) if claim == (owner, schema_id) => {}
            Some(&(first, first_schema)) => {
                let stages: Vec<String> = [first, owner]
                    .into_iter()
                    .filter(|id| *id != SEED_PRODUCER)
                    .map(str::to_string)
                    .collect();
                return Err(RoutingValidationError::new(format!(
                    "Key '{key}' is claimed by '{first}' ({first_schema}) and '{owner}' ({schema_id})"
                ))
                .with_stages(stages)
                .with_error_info(
                    ContractErrorInfo::new(codes::SHARED_WRITE, format!("Key '{key}' has more than one writer"))
                        .with_context_entry("key", key.to_string())
                        .with_fix_hint("Give each artifact key a single producing stage, or supply it only as a seed."),
                ));
            }
        }
    }
    Ok(())
}

fn unknown_target(stage: &str, edge: &str, target: &str) -> RoutingValidationError {
    RoutingValidationError::new(format!("Stage '{stage}' {edge} references unknown stage '{target}'"))
        .with_stages(vec![stage.to_string(), target.to_string()])
        .with_error_info(
            ContractErrorInfo::new(codes::UNKNOWN_TARGET, format!("Stage '{target}' not found"))
                .with_context_entry("edge", edge)
                .with_fix_hint("Declare the target stage or use $completed / $failed."),
        )
}

/// Success edges have out-degree one, so each walk either ends at a marker
/// or revisits a stage on its own path.
fn find_success_cycle(table: &RoutingTable) -> Option<Vec<String>> {
    let mut cleared: HashSet<&str> = HashSet::new();

    for start in &table.stages {
        let mut path: Vec<&str> = Vec::new();
        let mut current = Some(start);

        while let Some(stage) = current {
            if cleared.contains(stage.id.as_str()) {
                break;
            }
            if let Some(pos) = path.iter().position(|id| *id == stage.id) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(stage.id.clone());
                return Some(cycle);
            }
            path.push(&stage.id);
            current = stage.on_success.stage_id().and_then(|id| table.stage(id));
        }
        cleared.extend(path);
    }
    None
}

fn reachable_from<'a>(table: &'a RoutingTable, entry: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([entry]);

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(stage) = table.stage(id) {
            queue.extend(stage.targets());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(s: &str) -> ArtifactKey {
        s.parse().unwrap()
    }

    fn review_loop() -> RoutingTableBuilder {
        RoutingTable::builder("intake")
            .seed(key("type:Request"), "Request")
            .stage(
                StageDefinition::work("intake")
                    .reads(key("type:Request"))
                    .writes(key("type:Brief"), "Brief")
                    .on_success("plan"),
            )
            .stage(
                StageDefinition::work("plan")
                    .reads(key("type:Brief"))
                    .writes(key("type:Plan"), "Plan")
                    .on_success("review"),
            )
            .stage(
                StageDefinition::gate("review")
                    .reads(key("type:Plan"))
                    .on_success(Transition::Completed)
                    .on_failure("plan"),
            )
    }

    fn code(err: &RoutingValidationError) -> &str {
        err.code().unwrap_or_default()
    }

    #[test]
    fn test_valid_table() {
        let table = review_loop().build().unwrap();
        assert_eq!(table.entry(), "intake");
        assert_eq!(table.len(), 3);
        assert_eq!(table.success_path("intake"), vec!["intake", "plan", "review"]);
        assert_eq!(table.seed_schema(&key("type:Request")), Some("Request"));
        assert_eq!(
            table.schema_ids().into_iter().collect::<Vec<_>>(),
            vec!["Brief", "Plan", "Request"]
        );
        assert_eq!(
            table.next("review", Outcome::Failure, None),
            Some(Transition::stage("plan"))
        );
        assert_eq!(table.next("missing", Outcome::Success, None), None);
    }

    #[test]
    fn test_empty_table() {
        let err = RoutingTable::builder("a").build().unwrap_err();
        assert_eq!(code(&err), codes::EMPTY);
    }

    #[test]
    fn test_duplicate_and_blank_ids() {
        let err = review_loop().stage(StageDefinition::work("plan")).build().unwrap_err();
        assert_eq!(code(&err), codes::INVALID_STAGE);

        let err = RoutingTable::builder("a").stage(StageDefinition::work(" ")).build().unwrap_err();
        assert_eq!(code(&err), codes::INVALID_STAGE);
    }

    #[test]
    fn test_unknown_entry_and_targets() {
        let err = RoutingTable::builder("nope")
            .stage(StageDefinition::work("a"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::UNKNOWN_TARGET);

        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").on_success("ghost"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::UNKNOWN_TARGET);
        assert_eq!(err.stages, vec!["a".to_string(), "ghost".to_string()]);

        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").with_remediation_target("ghost"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::UNKNOWN_TARGET);
    }

    #[test]
    fn test_failure_to_success_rejected() {
        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").on_failure(Transition::Completed))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::FAILURE_TO_SUCCESS);
    }

    #[test]
    fn test_success_cycle_rejected() {
        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").on_success("b"))
            .stage(StageDefinition::work("b").on_success("c"))
            .stage(StageDefinition::work("c").on_success("b"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::CYCLE);
        assert_eq!(err.stages, vec!["b".to_string(), "c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_failure_cycles_allowed() {
        let table = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").on_success("b"))
            .stage(StageDefinition::gate("b").on_failure("a"))
            .build();
        assert!(table.is_ok());
    }

    #[test]
    fn test_unreachable_stage() {
        let err = review_loop().stage(StageDefinition::work("orphan")).build().unwrap_err();
        assert_eq!(code(&err), codes::UNREACHABLE);
        assert_eq!(err.stages, vec!["orphan".to_string()]);
    }

    #[test]
    fn test_remediation_target_counts_as_reachable() {
        let table = RoutingTable::builder("a")
            .stage(
                StageDefinition::gate("a")
                    .on_failure(Transition::Failed)
                    .with_remediation_target("fix"),
            )
            .stage(StageDefinition::work("fix").on_success("a"))
            .build();
        assert!(table.is_ok());
    }

    #[test]
    fn test_no_completion() {
        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").on_success(Transition::Failed))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::NO_COMPLETION);
    }

    #[test]
    fn test_unproduced_required_read() {
        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").reads(key("type:Ghost")))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::UNPRODUCED_READ);

        // Optional reads need no producer.
        let ok = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").reads_optional(key("type:Ghost")))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_shared_write_rejected() {
        let err = RoutingTable::builder("a")
            .seed(key("type:Plan"), "Plan")
            .stage(StageDefinition::work("a").writes(key("type:Plan"), "Plan").on_success("b"))
            .stage(
                StageDefinition::work("b")
                    .writes(key("type:Plan"), "Other")
                    .on_success(Transition::Completed),
            )
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::SHARED_WRITE);
        assert_eq!(err.stages, vec!["a".to_string()]);

        let err = RoutingTable::builder("a")
            .stage(StageDefinition::work("a").writes(key("type:Plan"), "Plan").on_success("b"))
            .stage(
                StageDefinition::work("b")
                    .writes(key("type:Plan"), "Plan")
                    .on_success(Transition::Completed),
            )
            .build()
            .unwrap_err();
        assert_eq!(code(&err), codes::SHARED_WRITE);
        assert_eq!(err.stages, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_json_round_trip_preserves_validation() {
        let table = review_loop().build().unwrap();
        let json = table.to_json().unwrap();
        assert_eq!(RoutingTable::from_json(&json).unwrap(), table);

        let invalid = r#"{"entry": "a", "stages": [{"id": "a", "on_success": "b"}]}"#;
        match RoutingTable::from_json(invalid) {
            Err(WorkflowError::Routing(err)) => assert_eq!(code(&err), codes::UNKNOWN_TARGET),
            other => panic!("expected routing error, got {other:?}"),
        }
        assert!(matches!(
            RoutingTable::from_json("{not json"),
            Err(WorkflowError::Serialization(_))
        ));
    }
}
