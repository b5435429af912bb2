//! Lifecycle events emitted by the coordinator.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by the coordinator.
pub mod event_types {
    /// A new instance was created.
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    /// An adapter invocation began.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage handed off with success.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage handed off with failure, or could not start.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// An adapter missed its deadline.
    pub const STAGE_TIMED_OUT: &str = "stage.timed_out";
    /// The run reached the success marker.
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    /// The run reached the failure marker.
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    /// The run was forced to stop.
    pub const WORKFLOW_ABORTED: &str = "workflow.aborted";
    /// A replayed envelope was ignored.
    pub const ENVELOPE_DUPLICATE: &str = "envelope.duplicate";
}
