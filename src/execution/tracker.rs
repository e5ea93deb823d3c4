//! Per-execution records and their state machine
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!    │           ├──────▶ error
//!    │           └──────▶ cancelled
//!    ├──────────────────▶ error       (kernel unavailable / submit failed)
//!    └──────────────────▶ cancelled
//! ```
//!
//! A record is *settled* once `finished_at` is set. Settled records accept no
//! further output. An `error` status can be reached before settling: the
//! dispatch loop keeps draining until the kernel goes idle.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Text of the system item appended on cancellation
pub const CANCELLED_MESSAGE: &str = "execution cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Error | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Error)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Result,
    Error,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    pub kind: OutputKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A captured figure, base64 encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedImage {
    pub data: String,
    pub format: String,
    /// Text description from the vision model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CapturedImage {
    pub fn png(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            format: "png".to_string(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: String,
    pub conversation_id: String,
    pub code: String,
    pub status: ExecutionStatus,
    pub output: Vec<OutputItem>,
    pub error: Option<String>,
    pub images: Vec<CapturedImage>,
    pub execution_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Output ordered by timestamp; ties keep arrival order
    pub fn sorted_output(&self) -> Vec<OutputItem> {
        let mut items = self.output.clone();
        items.sort_by_key(|item| item.timestamp);
        items
    }

    pub fn is_settled(&self) -> bool {
        self.finished_at.is_some()
    }

    fn transition(&mut self, next: ExecutionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            debug!(
                execution_id = %self.id,
                from = %self.status,
                to = %next,
                "ignoring invalid status transition"
            );
            return false;
        }
        self.status = next;
        true
    }
}

struct Entry {
    record: Execution,
    settled: watch::Sender<bool>,
}

impl Entry {
    fn settle(&mut self) {
        if self.record.finished_at.is_none() {
            self.record.finished_at = Some(Utc::now());
        }
        self.settled.send_replace(true);
    }
}

/// Owns every execution record
#[derive(Default)]
pub struct ExecutionTracker {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending execution and return its id
    pub async fn register(&self, conversation_id: &str, code: &str) -> String {
        let id = Uuid::now_v7().to_string();
        let (settled, _) = watch::channel(false);
        let record = Execution {
            id: id.clone(),
            conversation_id: conversation_id.to_string(),
            code: code.to_string(),
            status: ExecutionStatus::Pending,
            output: Vec::new(),
            error: None,
            images: Vec::new(),
            execution_count: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.entries
            .write()
            .await
            .insert(id.clone(), Entry { record, settled });
        id
    }

    /// `pending → running` on the kernel's input echo
    pub async fn mark_started(&self, id: &str, execution_count: Option<u64>) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.is_settled() || !entry.record.transition(ExecutionStatus::Running) {
            return false;
        }
        entry.record.started_at.get_or_insert_with(Utc::now);
        entry.record.execution_count = execution_count;
        true
    }

    /// Append an output item; `None` once the execution is settled
    pub async fn push_output(
        &self,
        id: &str,
        kind: OutputKind,
        content: impl Into<String>,
    ) -> Option<OutputItem> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id)?;
        if entry.record.is_settled() {
            debug!(execution_id = %id, ?kind, "dropping output for settled execution");
            return None;
        }
        let item = OutputItem {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        };
        entry.record.output.push(item.clone());
        Some(item)
    }

    pub async fn push_image(&self, id: &str, image: CapturedImage) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) if !entry.record.is_settled() => {
                entry.record.images.push(image);
                true
            }
            _ => false,
        }
    }

    /// Attach a description to image `index` of an unsettled execution
    pub async fn describe_image(&self, id: &str, index: usize, description: String) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) if !entry.record.is_settled() => {
                match entry.record.images.get_mut(index) {
                    Some(image) => {
                        image.description = Some(description);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Move to `error` without settling; the first error text wins
    pub async fn record_error(&self, id: &str, message: impl Into<String>) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.is_settled() || !entry.record.transition(ExecutionStatus::Error) {
            return false;
        }
        entry.record.error.get_or_insert_with(|| message.into());
        true
    }

    /// Settle after the kernel went idle: `running → completed` unless an
    /// error was already recorded
    pub async fn finish(&self, id: &str) -> Option<ExecutionStatus> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id)?;
        if entry.record.is_settled() {
            return Some(entry.record.status);
        }
        match entry.record.status {
            ExecutionStatus::Running => {
                entry.record.transition(ExecutionStatus::Completed);
            }
            ExecutionStatus::Pending => {
                entry.record.transition(ExecutionStatus::Error);
                entry
                    .record
                    .error
                    .get_or_insert_with(|| "kernel went idle before starting".to_string());
            }
            _ => {}
        }
        entry.settle();
        Some(entry.record.status)
    }

    /// `pending|running → cancelled`, appending exactly one system item
    pub async fn cancel(&self, id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.is_settled() || !entry.record.transition(ExecutionStatus::Cancelled) {
            return false;
        }
        entry.record.output.push(OutputItem {
            kind: OutputKind::System,
            content: CANCELLED_MESSAGE.to_string(),
            timestamp: Utc::now(),
        });
        entry.settle();
        true
    }

    /// Settle as `error` with `message` (startup failure, timeout, dead kernel)
    pub async fn abort(&self, id: &str, message: impl Into<String>) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.is_settled() {
            return false;
        }
        if !entry.record.transition(ExecutionStatus::Error) {
            warn!(execution_id = %id, status = %entry.record.status, "cannot abort execution");
            return false;
        }
        let message = message.into();
        entry.record.output.push(OutputItem {
            kind: OutputKind::Error,
            content: message.clone(),
            timestamp: Utc::now(),
        });
        entry.record.error.get_or_insert(message);
        entry.settle();
        true
    }

    pub async fn snapshot(&self, id: &str) -> Option<Execution> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.record.clone())
    }

    pub async fn status(&self, id: &str) -> Option<ExecutionStatus> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.record.status)
    }

    /// Wait until the execution settles, then return it
    pub async fn wait(&self, id: &str) -> Option<Execution> {
        let mut settled = {
            let entries = self.entries.read().await;
            entries.get(id)?.settled.subscribe()
        };
        if settled.wait_for(|done| *done).await.is_err() {
            // Record was pruned while waiting
            return None;
        }
        self.snapshot(id).await
    }

    /// Executions belonging to a conversation, oldest first
    pub async fn for_conversation(&self, conversation_id: &str) -> Vec<Execution> {
        let mut records: Vec<Execution> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.record.conversation_id == conversation_id)
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Drop settled records older than `older_than`; returns how many
    pub async fn prune(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| match entry.record.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Error, Cancelled] {
            assert!(terminal.is_terminal());
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "print('hi')").await;
        assert_eq!(tracker.status(&id).await, Some(ExecutionStatus::Pending));

        assert!(tracker.mark_started(&id, Some(1)).await);
        tracker.push_output(&id, OutputKind::Stdout, "hi\n").await.unwrap();
        assert_eq!(tracker.finish(&id).await, Some(ExecutionStatus::Completed));

        let record = tracker.wait(&id).await.unwrap();
        assert_eq!(record.execution_count, Some(1));
        assert_eq!(record.output.len(), 1);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_error_survives_idle() {
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "1/0").await;
        tracker.mark_started(&id, Some(1)).await;
        assert!(tracker.record_error(&id, "ZeroDivisionError: division by zero").await);
        // Output after the error is still accepted until idle
        assert!(tracker.push_output(&id, OutputKind::Stderr, "late").await.is_some());
        tracker.record_error(&id, "second").await;
        assert_eq!(tracker.finish(&id).await, Some(ExecutionStatus::Error));

        let record = tracker.snapshot(&id).await.unwrap();
        assert_eq!(record.error.as_deref(), Some("ZeroDivisionError: division by zero"));
    }

    #[tokio::test]
    async fn test_cancel_appends_one_system_item_and_blocks_output() {
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "while True: pass").await;
        tracker.mark_started(&id, Some(1)).await;
        tracker.push_output(&id, OutputKind::Stdout, "tick\n").await;

        assert!(tracker.cancel(&id).await);
        assert!(!tracker.cancel(&id).await);
        assert!(tracker.push_output(&id, OutputKind::Stdout, "after").await.is_none());
        assert_eq!(tracker.finish(&id).await, Some(ExecutionStatus::Cancelled));
        assert!(!tracker.abort(&id, "late timeout").await);

        let record = tracker.snapshot(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        let system: Vec<_> = record
            .output
            .iter()
            .filter(|i| i.kind == OutputKind::System)
            .collect();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].content, CANCELLED_MESSAGE);
        assert_eq!(record.output.last().unwrap().kind, OutputKind::System);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "x").await;
        assert!(tracker.cancel(&id).await);
        assert!(!tracker.mark_started(&id, Some(1)).await);
        assert_eq!(tracker.status(&id).await, Some(ExecutionStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_abort_pending_is_error() {
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "x").await;
        assert!(tracker.abort(&id, "kernel unavailable").await);
        let record = tracker.wait(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.error.as_deref(), Some("kernel unavailable"));
        assert_eq!(record.output[0].kind, OutputKind::Error);
    }

    #[tokio::test]
    async fn test_sorted_output_is_stable() {
        let base = Utc::now();
        let item = |kind, content: &str, offset| OutputItem {
            kind,
            content: content.to_string(),
            timestamp: base + chrono::Duration::milliseconds(offset),
        };
        let record = Execution {
            id: "e".into(),
            conversation_id: "c".into(),
            code: String::new(),
            status: ExecutionStatus::Completed,
            output: vec![
                item(OutputKind::Stderr, "b", 5),
                item(OutputKind::Stdout, "a", 0),
                item(OutputKind::Result, "c", 5),
            ],
            error: None,
            images: vec![],
            execution_count: None,
            created_at: base,
            started_at: None,
            finished_at: None,
        };
        let contents: Vec<_> = record
            .sorted_output()
            .into_iter()
            .map(|i| i.content)
            .collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_prune_only_settled() {
        let tracker = ExecutionTracker::new();
        let done = tracker.register("c", "1").await;
        let live = tracker.register("c", "2").await;
        tracker.abort(&done, "x").await;

        assert_eq!(tracker.prune(Duration::ZERO).await, 1);
        assert!(tracker.snapshot(&done).await.is_none());
        assert!(tracker.snapshot(&live).await.is_some());
        assert_eq!(tracker.for_conversation("c").await.len(), 1);
    }
}
