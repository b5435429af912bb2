//! Handoff protocol between adapters and the coordinator.

mod envelope;
mod violation;

pub use envelope::HandoffEnvelope;
pub use violation::ContractViolation;
