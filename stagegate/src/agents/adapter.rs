//! The adapter interface between the coordinator and opaque workers.

use crate::cancellation::CancellationToken;
use crate::core::ArtifactKey;
use crate::handoff::HandoffEnvelope;
use crate::registry::ScopedRegistry;
use crate::routing::ReadSpec;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Everything an adapter receives for one stage invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The workflow instance.
    pub instance_id: Uuid,
    /// The stage being run.
    pub stage_id: String,
    /// Position of this invocation in the instance history, starting at 1.
    pub sequence: u64,
    /// Declared inputs.
    pub read_set: Vec<ReadSpec>,
    /// Registry handle limited to the stage's read and write sets.
    pub registry: ScopedRegistry,
    /// Cancelled when the invocation times out or the run is cancelled.
    pub cancellation: Arc<CancellationToken>,
}

impl Invocation {
    /// Keys of the declared inputs.
    pub fn input_keys(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.read_set.iter().map(|r| &r.key)
    }

    /// Returns true once the invocation should stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A worker the coordinator can invoke for a stage.
///
/// Adapters write their outputs through `invocation.registry` and report
/// the result as a [`HandoffEnvelope`]. They run on their own task and
/// should watch `invocation.cancellation` during long work.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Runs the stage.
    async fn run(&self, invocation: &Invocation) -> HandoffEnvelope;
}

/// Adapter backed by an async closure.
pub struct FnAdapter<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = HandoffEnvelope> + Send,
{
    name: String,
    func: F,
}

impl<F, Fut> FnAdapter<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = HandoffEnvelope> + Send,
{
    /// Creates a closure-backed adapter.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }

    /// The adapter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F, Fut> Debug for FnAdapter<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = HandoffEnvelope> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAdapter").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> AgentAdapter for FnAdapter<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = HandoffEnvelope> + Send,
{
    async fn run(&self, invocation: &Invocation) -> HandoffEnvelope {
        (self.func)(invocation.clone()).await
    }
}
