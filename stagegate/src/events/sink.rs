//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// Receives workflow lifecycle events.
///
/// Sinks must not fail the run: errors are logged and suppressed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// * `event_type` - dotted event name (e.g. `stage.started`)
    /// * `data` - optional structured payload
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without awaiting.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards all events. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Info-level sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let data = data.map(ToString::to_string).unwrap_or_default();
        match self.level {
            Level::TRACE | Level::DEBUG => debug!(event_type, event_data = %data, "Event: {}", event_type),
            Level::WARN | Level::ERROR => warn!(event_type, event_data = %data, "Event: {}", event_type),
            _ => info!(event_type, event_data = %data, "Event: {}", event_type),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Keeps every event in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Event names, in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Events whose name starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("workflow.started", None).await;
        LoggingEventSink::debug()
            .emit("stage.started", Some(json!({"stage": "plan"})))
            .await;
        LoggingEventSink::new(Level::WARN).try_emit("workflow.aborted", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_order_and_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stage.started", None).await;
        sink.try_emit("stage.completed", Some(json!({"stage": "plan"})));
        sink.emit("workflow.completed", None).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(
            sink.event_types(),
            vec!["stage.started", "stage.completed", "workflow.completed"]
        );
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.events()[1].1, Some(json!({"stage": "plan"})));

        sink.clear();
        assert!(sink.is_empty());
    }
}
