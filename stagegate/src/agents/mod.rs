//! Agent adapters: the invocation boundary and the built-in gate stage.

mod adapter;
mod gate;

pub use adapter::{AgentAdapter, FnAdapter, Invocation};
pub use gate::{GateAdapter, GateDecision, GateInputs, GatePolicy, PredicatePolicy, RequiredFieldsPolicy};
