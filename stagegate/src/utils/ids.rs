//! Workflow instance identifiers.

use uuid::Uuid;

/// Prefix of every per-instance storage namespace.
pub const INSTANCE_NAMESPACE_PREFIX: &str = "wf/";

/// Generates a new, time-ordered workflow instance id (UUID v7).
///
/// Time ordering keeps `list_instances` output roughly in creation order
/// without a secondary index.
#[must_use]
pub fn generate_instance_id() -> Uuid {
    Uuid::now_v7()
}

/// Returns the storage namespace owned by one workflow instance.
#[must_use]
pub fn instance_namespace(instance_id: &Uuid) -> String {
    format!("{INSTANCE_NAMESPACE_PREFIX}{instance_id}")
}

/// Parses an instance id back out of a namespace produced by [`instance_namespace`].
#[must_use]
pub fn instance_id_from_namespace(namespace: &str) -> Option<Uuid> {
    namespace
        .strip_prefix(INSTANCE_NAMESPACE_PREFIX)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}
