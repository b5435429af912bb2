//! Declarative routing: stage definitions and the validated stage graph.

mod stage;
mod table;

pub use stage::{ReadSpec, StageDefinition, Transition, WriteSpec, COMPLETED_MARKER, FAILED_MARKER};
pub use table::{RoutingTable, RoutingTableBuilder, RoutingTableDef, SeedKey};
