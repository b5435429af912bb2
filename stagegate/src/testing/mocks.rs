//! Mock adapters and backends for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentAdapter, Invocation};
use crate::core::{ArtifactKey, IssueReport, RESERVED_KEY_PREFIX};
use crate::errors::StoreError;
use crate::handoff::HandoffEnvelope;
use crate::store::{InMemoryBackend, KvBackend, VersionedRecord};

/// One scripted invocation: artifacts to write, then the envelope to return.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    /// Artifacts written through the invocation's scope, in order.
    pub writes: Vec<(ArtifactKey, Value)>,
    /// Envelope to return. `None` returns success listing the written keys.
    pub envelope: Option<HandoffEnvelope>,
}

/// An adapter that replays a fixed script, one step per invocation.
///
/// Once the script runs out the last step repeats.
#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    steps: Mutex<Vec<ScriptStep>>,
    calls: Mutex<Vec<u64>>,
}

impl ScriptedAdapter {
    /// Creates an adapter with an empty script. It succeeds without writing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step that writes one artifact and succeeds.
    #[must_use]
    pub fn then_write(self, key: ArtifactKey, payload: Value) -> Self {
        self.then_step(ScriptStep {
            writes: vec![(key, payload)],
            envelope: None,
        })
    }

    /// Appends a step that fails with `issue`.
    #[must_use]
    pub fn then_fail(self, issue: IssueReport) -> Self {
        self.then_step(ScriptStep {
            writes: Vec::new(),
            envelope: Some(HandoffEnvelope::failure(issue)),
        })
    }

    /// Appends a step that writes artifacts and returns `envelope` verbatim.
    #[must_use]
    pub fn then_respond(self, writes: Vec<(ArtifactKey, Value)>, envelope: HandoffEnvelope) -> Self {
        self.then_step(ScriptStep {
            writes,
            envelope: Some(envelope),
        })
    }

    /// Appends a raw step.
    #[must_use]
    pub fn then_step(self, step: ScriptStep) -> Self {
        self.steps.lock().push(step);
        self
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sequence numbers of every invocation.
    #[must_use]
    pub fn sequences(&self) -> Vec<u64> {
        self.calls.lock().clone()
    }

    fn next_step(&self, sequence: u64) -> Option<ScriptStep> {
        let mut calls = self.calls.lock();
        let index = calls.len();
        calls.push(sequence);
        drop(calls);

        let steps = self.steps.lock();
        steps.get(index).or_else(|| steps.last()).cloned()
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    async fn run(&self, invocation: &Invocation) -> HandoffEnvelope {
        let Some(step) = self.next_step(invocation.sequence) else {
            return HandoffEnvelope::success(Vec::new());
        };

        let mut written = Vec::new();
        for (key, payload) in step.writes {
            // Rejections are recorded on the scope and judged by the coordinator.
            if invocation.registry.put(&key, payload).await.is_ok() {
                written.push(key);
            }
        }
        step.envelope.unwrap_or_else(|| HandoffEnvelope::success(written))
    }
}

/// An adapter that sleeps before returning its envelope.
///
/// Returns early with a failure envelope if the invocation is cancelled.
#[derive(Debug, Clone)]
pub struct SlowAdapter {
    delay: Duration,
    envelope: HandoffEnvelope,
}

impl SlowAdapter {
    /// Creates an adapter that succeeds after `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            envelope: HandoffEnvelope::success(Vec::new()),
        }
    }

    /// Sets the envelope returned after the delay.
    #[must_use]
    pub fn with_envelope(mut self, envelope: HandoffEnvelope) -> Self {
        self.envelope = envelope;
        self
    }
}

#[async_trait]
impl AgentAdapter for SlowAdapter {
    async fn run(&self, invocation: &Invocation) -> HandoffEnvelope {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => self.envelope.clone(),
            () = invocation.cancellation.cancelled() => HandoffEnvelope::failure(IssueReport::new(
                crate::core::IssueCategory::Cancelled,
                "interrupted",
            )),
        }
    }
}

/// An adapter that always panics.
#[derive(Debug, Clone)]
pub struct PanickingAdapter {
    message: String,
}

impl PanickingAdapter {
    /// Creates an adapter panicking with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl AgentAdapter for PanickingAdapter {
    async fn run(&self, _invocation: &Invocation) -> HandoffEnvelope {
        panic!("{}", self.message);
    }
}

/// Shared, ordered log of `(stage, sequence)` invocations.
pub type CallLog = Arc<Mutex<Vec<(String, u64)>>>;

/// Wraps an adapter and records every invocation into a shared log.
pub struct RecordingAdapter {
    inner: Arc<dyn AgentAdapter>,
    log: CallLog,
}

impl RecordingAdapter {
    /// Wraps `inner`, appending to `log`.
    pub fn new(inner: Arc<dyn AgentAdapter>, log: CallLog) -> Self {
        Self { inner, log }
    }

    /// Stage ids of every recorded invocation, in order.
    #[must_use]
    pub fn stages(log: &CallLog) -> Vec<String> {
        log.lock().iter().map(|(stage, _)| stage.clone()).collect()
    }
}

impl std::fmt::Debug for RecordingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingAdapter")
            .field("calls", &self.log.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentAdapter for RecordingAdapter {
    async fn run(&self, invocation: &Invocation) -> HandoffEnvelope {
        self.log
            .lock()
            .push((invocation.stage_id.clone(), invocation.sequence));
        self.inner.run(invocation).await
    }
}

/// A backend whose artifact writes always lose compare-and-set.
///
/// Reserved records (such as the instance record) are written normally so
/// the coordinator can still persist state.
#[derive(Debug, Default)]
pub struct ContendedBackend {
    inner: InMemoryBackend,
    only: Option<BTreeSet<String>>,
}

impl ContendedBackend {
    /// Contends every artifact key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Contends only the listed artifact keys.
    #[must_use]
    pub fn for_keys(keys: impl IntoIterator<Item = ArtifactKey>) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            only: Some(keys.into_iter().map(|k| k.to_string()).collect()),
        }
    }

    fn contended(&self, key: &str) -> bool {
        !key.starts_with(RESERVED_KEY_PREFIX) && self.only.as_ref().map_or(true, |only| only.contains(key))
    }
}

#[async_trait]
impl KvBackend for ContendedBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        self.inner.get(namespace, key).await
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: u64,
        value: Value,
    ) -> Result<u64, StoreError> {
        if self.contended(key) {
            return Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                key: key.to_string(),
                expected,
                actual: expected + 1,
            });
        }
        self.inner.compare_and_set(namespace, key, expected, value).await
    }

    async fn scan_page(
        &self,
        namespace: &str,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, VersionedRecord)>, StoreError> {
        self.inner.scan_page(namespace, prefix, after, limit).await
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.inner.namespaces().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IssueCategory;

    fn key(s: &str) -> ArtifactKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_scripted_adapter_repeats_last_step() {
        let adapter = ScriptedAdapter::new()
            .then_write(key("type:Plan"), serde_json::json!({}))
            .then_fail(IssueReport::new(IssueCategory::Validation, "no"));

        let first = adapter.next_step(1).unwrap();
        assert!(first.envelope.is_none());
        let second = adapter.next_step(2).unwrap();
        let third = adapter.next_step(3).unwrap();
        assert_eq!(second.envelope, third.envelope);
        assert_eq!(adapter.call_count(), 3);
        assert_eq!(adapter.sequences(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_contended_backend_spares_reserved_keys() {
        let backend = ContendedBackend::for_keys([key("type:Plan")]);
        assert!(backend.compare_and_set("ns", "type:Plan", 0, Value::Null).await.is_err());
        assert_eq!(backend.compare_and_set("ns", "type:Other", 0, Value::Null).await.unwrap(), 1);
        assert_eq!(backend.compare_and_set("ns", "$instance", 0, Value::Null).await.unwrap(), 1);

        let all = ContendedBackend::new();
        assert!(all.compare_and_set("ns", "type:Other", 0, Value::Null).await.is_err());
    }
}
