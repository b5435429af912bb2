//! Identifier and timestamp helpers shared across the crate.

pub mod timestamps;
mod ids;

pub use ids::{generate_instance_id, instance_id_from_namespace, instance_namespace, INSTANCE_NAMESPACE_PREFIX};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
