//! The workflow coordinator.
//!
//! - [`Coordinator`] runs instances through a [`RoutingTable`](crate::routing::RoutingTable)
//! - [`InstanceStore`] persists instance records next to their artifacts
//! - [`Inspector`] exposes read-only views

mod engine;
mod inspect;
mod instance;
mod instance_store;


pub use engine::{Applied, Coordinator, CoordinatorBuilder, StepReport};
pub use inspect::{InstanceSummary, Inspector};
pub use instance::{HistoryEntry, NextState, WorkflowInstance};
pub use instance_store::{InstanceStore, INSTANCE_RECORD_KEY};
