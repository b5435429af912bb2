//! Cooperative cancellation.
//!
//! The coordinator holds one [`CancellationToken`] per running instance and
//! hands each adapter invocation a child token.

mod token;

pub use token::{CancelCallback, CancellationToken};
