//! Stage spans and timing.

use std::time::Instant;
use tracing::Span;
use uuid::Uuid;

/// Span wrapping one stage invocation.
#[must_use]
pub fn stage_span(instance_id: Uuid, stage: &str, sequence: u64) -> Span {
    tracing::info_span!("stage", %instance_id, stage, sequence)
}

/// Simple wall-clock timer for stage durations.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Elapsed milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// The timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
