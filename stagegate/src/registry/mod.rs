//! Type registry: versioned artifacts, change notifications and access scopes.
//!
//! This module provides:
//! - [`TypeRegistry`] for validated compare-and-set writes, reads and scans
//! - [`ScopedRegistry`], the per-invocation handle that enforces read/write sets
//! - [`ConflictRetryPolicy`] for bounded retry of version conflicts

mod retry;
mod scope;
mod type_registry;

pub use retry::{with_conflict_retry, BackoffStrategy, ConflictRetryPolicy, JitterStrategy, RetryError};
pub use scope::{RejectedWrite, ScopeViolationRecord, ScopedRegistry};
pub use type_registry::{ArtifactChange, TypeRegistry, DEFAULT_CHANNEL_CAPACITY, DEFAULT_SCAN_PAGE_SIZE};
