//! Structured events emitted by the execution engine and agent loops
//!
//! The core never talks to network clients directly. Everything that a UI
//! would want to render is published as an [`Event`] on an [`EventSink`],
//! and whoever owns the sink decides how to fan it out.
//!
//! # Envelope
//!
//! ```text
//! { "type": "code_execution_output",
//!   "data": { "conversation_id": "...", "execution_id": "...",
//!             "timestamp": "2025-01-01T12:00:00Z", ... } }
//! ```

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::info;

/// Every event type the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolInvocationStart,
    ToolInvocationResult,
    AssistantMessage,
    UserAgentMessage,
    CodeExecutionStart,
    CodeExecutionOutput,
    CodeExecutionImage,
    CodeExecutionEnd,
    Done,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ToolInvocationStart => "tool_invocation_start",
            EventType::ToolInvocationResult => "tool_invocation_result",
            EventType::AssistantMessage => "assistant_message",
            EventType::UserAgentMessage => "user_agent_message",
            EventType::CodeExecutionStart => "code_execution_start",
            EventType::CodeExecutionOutput => "code_execution_output",
            EventType::CodeExecutionImage => "code_execution_image",
            EventType::CodeExecutionEnd => "code_execution_end",
            EventType::Done => "done",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single broadcast event: `{type, data}`
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
}

impl Event {
    /// Build an event, stamping `timestamp` and `conversation_id` into `data`.
    ///
    /// Non-object payloads are wrapped as `{"value": payload}`.
    pub fn new(event_type: EventType, conversation_id: &str, data: Value) -> Self {
        let mut fields = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        fields.insert(
            "conversation_id".to_string(),
            Value::String(conversation_id.to_string()),
        );
        fields
            .entry("timestamp".to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        Self {
            event_type,
            data: Value::Object(fields),
        }
    }

    /// Build an execution-scoped event (adds `execution_id`).
    pub fn for_execution(
        event_type: EventType,
        conversation_id: &str,
        execution_id: &str,
        data: Value,
    ) -> Self {
        let mut event = Self::new(event_type, conversation_id, data);
        if let Value::Object(fields) = &mut event.data {
            fields.insert(
                "execution_id".to_string(),
                Value::String(execution_id.to_string()),
            );
        }
        event
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.data.get("conversation_id").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Receiver of structured events
///
/// Implementations must not block: emission happens inline in the agent and
/// dispatch loops.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);

    /// Shorthand for `emit(Event::new(..))`
    fn publish(&self, event_type: EventType, conversation_id: &str, data: Value) {
        self.emit(Event::new(event_type, conversation_id, data));
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: Event) {
        (**self).emit(event)
    }
}

/// In-process fan-out over a tokio broadcast channel
///
/// Slow subscribers lag (and drop events) instead of blocking emitters.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        info!(event_type = %event.event_type, data = %event.data, "event");
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Keeps every event in memory, in emission order
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
