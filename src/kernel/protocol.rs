//! Kernel wire protocol
//!
//! One JSON object per line in each direction, shaped like Jupyter messages:
//!
//! ```text
//! host → kernel   {"header": {"msg_id": "a1", "msg_type": "execute_request"},
//!                  "parent_header": {}, "content": {"code": "print('hi')"}}
//! kernel → host   {"header": {"msg_id": "k7", "msg_type": "stream"},
//!                  "parent_header": {"msg_id": "a1"},
//!                  "content": {"name": "stdout", "text": "hi\n"}}
//! ```
//!
//! Every reply carries the request's `msg_id` as its parent, which is how one
//! execution's output is separated from another's on the shared stream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

/// A protocol message in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub content: Value,
}

/// Which output stream a `stream` message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Kernel activity state reported by `status` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// Typed view of a kernel → host message
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// The kernel accepted the code and assigned it a counter
    ExecuteInput { execution_count: Option<u64> },
    Stream { name: StreamName, text: String },
    /// `display_data` or `execute_result`, keyed by MIME type
    Rich { data: Map<String, Value> },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Status(ExecutionState),
    KernelInfo,
    Other(String),
}

impl KernelMessage {
    pub fn new(msg_type: &str, parent: Option<&str>, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: Uuid::now_v7().to_string(),
                msg_type: msg_type.to_string(),
            },
            parent_header: ParentHeader {
                msg_id: parent.map(str::to_string),
            },
            content,
        }
    }

    // ── Requests ────────────────────────────────────────────────────────────

    pub fn execute_request(code: &str) -> Self {
        Self::new("execute_request", None, json!({ "code": code }))
    }

    pub fn kernel_info_request() -> Self {
        Self::new("kernel_info_request", None, json!({}))
    }

    pub fn shutdown_request() -> Self {
        Self::new("shutdown_request", None, json!({}))
    }

    // ── Replies (what the driver sends; used by in-process kernels) ─────────

    pub fn status(parent: &str, state: ExecutionState) -> Self {
        let state = match state {
            ExecutionState::Starting => "starting",
            ExecutionState::Busy => "busy",
            ExecutionState::Idle => "idle",
        };
        Self::new("status", Some(parent), json!({ "execution_state": state }))
    }

    pub fn execute_input(parent: &str, code: &str, execution_count: u64) -> Self {
        Self::new(
            "execute_input",
            Some(parent),
            json!({ "code": code, "execution_count": execution_count }),
        )
    }

    pub fn stream(parent: &str, name: StreamName, text: &str) -> Self {
        let name = match name {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        };
        Self::new("stream", Some(parent), json!({ "name": name, "text": text }))
    }

    pub fn execute_result(parent: &str, execution_count: u64, data: Value) -> Self {
        Self::new(
            "execute_result",
            Some(parent),
            json!({ "execution_count": execution_count, "data": data, "metadata": {} }),
        )
    }

    pub fn display_data(parent: &str, data: Value) -> Self {
        Self::new(
            "display_data",
            Some(parent),
            json!({ "data": data, "metadata": {} }),
        )
    }

    pub fn error(parent: &str, ename: &str, evalue: &str, traceback: &[String]) -> Self {
        Self::new(
            "error",
            Some(parent),
            json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
        )
    }

    pub fn kernel_info_reply(parent: &str) -> Self {
        Self::new(
            "kernel_info_reply",
            Some(parent),
            json!({ "status": "ok", "implementation": "codevisor" }),
        )
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Correlation id: the `msg_id` of the request this message answers
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.msg_id.as_deref()
    }

    /// Code carried by an `execute_request`
    pub fn code(&self) -> Option<&str> {
        self.content.get("code").and_then(Value::as_str)
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Classify the message
    pub fn event(&self) -> KernelEvent {
        let content = &self.content;
        let text = |key: &str| {
            content
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match self.msg_type() {
            "execute_input" => KernelEvent::ExecuteInput {
                execution_count: content.get("execution_count").and_then(Value::as_u64),
            },
            "stream" => KernelEvent::Stream {
                name: if content.get("name").and_then(Value::as_str) == Some("stderr") {
                    StreamName::Stderr
                } else {
                    StreamName::Stdout
                },
                text: text("text"),
            },
            "display_data" | "execute_result" => KernelEvent::Rich {
                data: content
                    .get("data")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            },
            "error" => KernelEvent::Error {
                ename: text("ename"),
                evalue: text("evalue"),
                traceback: content
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "status" => match content.get("execution_state").and_then(Value::as_str) {
                Some("idle") => KernelEvent::Status(ExecutionState::Idle),
                Some("busy") => KernelEvent::Status(ExecutionState::Busy),
                Some("starting") => KernelEvent::Status(ExecutionState::Starting),
                other => KernelEvent::Other(format!("status:{}", other.unwrap_or("?"))),
            },
            "kernel_info_reply" => KernelEvent::KernelInfo,
            other => KernelEvent::Other(other.to_string()),
        }
    }
}
