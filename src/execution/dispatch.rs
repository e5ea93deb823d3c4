//! Message dispatch loop for a single in-flight execution
//!
//! Reads the kernel's output stream, keeps only messages whose parent is the
//! submitted request, and turns them into tracker updates. The loop ends on a
//! correlated `idle` status seen after the input echo, on cancellation, on the
//! overall deadline, or when the kernel goes away.

use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::tracker::{CapturedImage, ExecutionTracker, OutputItem, OutputKind};
use crate::kernel::{EventReceiver, ExecutionState, KernelEvent, StreamName};

/// How one drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Correlated idle observed after start
    Idle,
    Cancelled,
    TimedOut,
    /// The kernel's stream closed
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Upper bound on a single receive; expiry just means "nothing yet"
    pub poll_interval: Duration,
    /// Overall deadline for the execution
    pub deadline: Instant,
}

/// Drain kernel messages for `correlation_id` into `execution_id`'s record
///
/// `observer` is called with every output item the tracker accepted.
pub async fn drain_execution<F>(
    events: &mut EventReceiver,
    correlation_id: &str,
    execution_id: &str,
    tracker: &ExecutionTracker,
    cancel: &CancellationToken,
    options: DispatchOptions,
    mut observer: F,
) -> DispatchOutcome
where
    F: FnMut(&OutputItem),
{
    let mut started = false;

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(execution_id, "dispatch cancelled");
                return DispatchOutcome::Cancelled;
            }
            _ = tokio::time::sleep_until(options.deadline) => {
                warn!(execution_id, "execution deadline reached");
                return DispatchOutcome::TimedOut;
            }
            received = timeout(options.poll_interval, events.recv()) => match received {
                Err(_) => continue,
                Ok(None) => return DispatchOutcome::Disconnected,
                Ok(Some(message)) => message,
            },
        };

        if message.parent_id() != Some(correlation_id) {
            trace!(
                execution_id,
                msg_type = message.msg_type(),
                parent = ?message.parent_id(),
                "skipping uncorrelated kernel message"
            );
            continue;
        }

        match message.event() {
            KernelEvent::ExecuteInput { execution_count } => {
                started = true;
                tracker.mark_started(execution_id, execution_count).await;
            }
            KernelEvent::Stream { name, text } => {
                let kind = match name {
                    StreamName::Stdout => OutputKind::Stdout,
                    StreamName::Stderr => OutputKind::Stderr,
                };
                if let Some(item) = tracker.push_output(execution_id, kind, text).await {
                    observer(&item);
                }
            }
            KernelEvent::Rich { data } => {
                if let Some(png) = data.get("image/png").and_then(|v| v.as_str()) {
                    tracker
                        .push_image(execution_id, CapturedImage::png(png))
                        .await;
                } else if let Some(text) = data.get("text/plain").and_then(|v| v.as_str()) {
                    if let Some(item) = tracker
                        .push_output(execution_id, OutputKind::Result, text)
                        .await
                    {
                        observer(&item);
                    }
                }
            }
            KernelEvent::Error {
                ename,
                evalue,
                traceback,
            } => {
                // The execution's error text is the full traceback
                let content = if traceback.is_empty() {
                    format!("{ename}: {evalue}")
                } else {
                    traceback.join("\n")
                };
                if let Some(item) = tracker
                    .push_output(execution_id, OutputKind::Error, content.clone())
                    .await
                {
                    observer(&item);
                }
                tracker.record_error(execution_id, content).await;
            }
            KernelEvent::Status(ExecutionState::Idle) if started => {
                return DispatchOutcome::Idle;
            }
            _ => {}
        }
    }
}

/// After an interrupt, discard messages until the interrupted request goes
/// idle so the next execution starts on a quiet kernel
///
/// Returns false if `grace` elapsed or the stream closed first.
pub async fn settle_after_interrupt(
    events: &mut EventReceiver,
    correlation_id: &str,
    grace: Duration,
) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) | Ok(None) => return false,
            Ok(Some(message)) => {
                if message.parent_id() == Some(correlation_id)
                    && message.event() == KernelEvent::Status(ExecutionState::Idle)
                {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::tracker::ExecutionStatus;
    use crate::kernel::KernelMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn options(secs: u64) -> DispatchOptions {
        DispatchOptions {
            poll_interval: Duration::from_millis(20),
            deadline: Instant::now() + Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn test_drain_classifies_and_filters() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "code").await;
        let parent = "req-1";

        // Leftover from an earlier request must be ignored
        tx.send(KernelMessage::stream("req-0", StreamName::Stdout, "stale\n"))
            .unwrap();
        tx.send(KernelMessage::status("req-0", ExecutionState::Idle))
            .unwrap();
        tx.send(KernelMessage::status(parent, ExecutionState::Busy))
            .unwrap();
        tx.send(KernelMessage::execute_input(parent, "code", 4)).unwrap();
        tx.send(KernelMessage::stream(parent, StreamName::Stdout, "hi\n"))
            .unwrap();
        tx.send(KernelMessage::stream(parent, StreamName::Stderr, "warn\n"))
            .unwrap();
        tx.send(KernelMessage::display_data(
            parent,
            json!({"image/png": "iVBORw0KGgo=", "text/plain": "<Figure>"}),
        ))
        .unwrap();
        tx.send(KernelMessage::execute_result(parent, 4, json!({"text/plain": "42"})))
            .unwrap();
        tx.send(KernelMessage::status(parent, ExecutionState::Idle))
            .unwrap();

        let mut seen = Vec::new();
        let outcome = drain_execution(
            &mut rx,
            parent,
            &id,
            &tracker,
            &CancellationToken::new(),
            options(5),
            |item| seen.push(item.kind),
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Idle);
        assert_eq!(
            seen,
            vec![OutputKind::Stdout, OutputKind::Stderr, OutputKind::Result]
        );

        tracker.finish(&id).await;
        let record = tracker.snapshot(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.execution_count, Some(4));
        assert_eq!(record.images.len(), 1);
        assert_eq!(record.images[0].format, "png");
        assert!(record.output.iter().all(|i| i.content != "stale\n"));
    }

    #[tokio::test]
    async fn test_idle_before_start_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "x").await;

        tx.send(KernelMessage::status("p", ExecutionState::Idle)).unwrap();
        tx.send(KernelMessage::execute_input("p", "x", 1)).unwrap();
        tx.send(KernelMessage::error("p", "NameError", "name 'x' is not defined", &[]))
            .unwrap();
        tx.send(KernelMessage::stream("p", StreamName::Stderr, "after error\n"))
            .unwrap();
        tx.send(KernelMessage::status("p", ExecutionState::Idle)).unwrap();

        let outcome = drain_execution(
            &mut rx,
            "p",
            &id,
            &tracker,
            &CancellationToken::new(),
            options(5),
            |_| {},
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Idle);

        let record = tracker.snapshot(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.output.len(), 2);
        assert_eq!(record.output[0].content, "NameError: name 'x' is not defined");
    }

    #[tokio::test]
    async fn test_error_text_is_the_joined_traceback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "1/0").await;

        let traceback = vec![
            "Traceback (most recent call last):".to_string(),
            "  File \"<cell>\", line 1".to_string(),
            "ZeroDivisionError: division by zero".to_string(),
        ];
        tx.send(KernelMessage::execute_input("p", "1/0", 1)).unwrap();
        tx.send(KernelMessage::error("p", "ZeroDivisionError", "division by zero", &traceback))
            .unwrap();
        tx.send(KernelMessage::status("p", ExecutionState::Idle)).unwrap();

        drain_execution(
            &mut rx,
            "p",
            &id,
            &tracker,
            &CancellationToken::new(),
            options(5),
            |_| {},
        )
        .await;

        let record = tracker.snapshot(&id).await.unwrap();
        assert_eq!(record.error.as_deref(), Some(traceback.join("\n").as_str()));
        assert_eq!(record.output[0].content, traceback.join("\n"));
    }

    #[tokio::test]
    async fn test_receive_timeouts_do_not_terminate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "x").await;

        tokio::spawn(async move {
            tx.send(KernelMessage::execute_input("p", "x", 1)).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(KernelMessage::status("p", ExecutionState::Idle)).unwrap();
            // Keep the stream open past the idle
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let outcome = drain_execution(
            &mut rx,
            "p",
            &id,
            &tracker,
            &CancellationToken::new(),
            options(5),
            |_| {},
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Idle);
    }

    #[tokio::test]
    async fn test_cancel_deadline_and_disconnect() {
        let tracker = ExecutionTracker::new();
        let id = tracker.register("c", "x").await;

        let (_tx, mut rx) = mpsc::unbounded_channel::<KernelMessage>();
        let token = CancellationToken::new();
        token.cancel();
        let outcome =
            drain_execution(&mut rx, "p", &id, &tracker, &token, options(5), |_| {}).await;
        assert_eq!(outcome, DispatchOutcome::Cancelled);

        let outcome = drain_execution(
            &mut rx,
            "p",
            &id,
            &tracker,
            &CancellationToken::new(),
            DispatchOptions {
                poll_interval: Duration::from_millis(10),
                deadline: Instant::now() + Duration::from_millis(50),
            },
            |_| {},
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::TimedOut);

        let (tx, mut closed) = mpsc::unbounded_channel::<KernelMessage>();
        drop(tx);
        let outcome = drain_execution(
            &mut closed,
            "p",
            &id,
            &tracker,
            &CancellationToken::new(),
            options(5),
            |_| {},
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Disconnected);
    }

    #[tokio::test]
    async fn test_settle_after_interrupt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(KernelMessage::error("p", "KeyboardInterrupt", "", &[]))
            .unwrap();
        tx.send(KernelMessage::status("p", ExecutionState::Idle)).unwrap();
        assert!(settle_after_interrupt(&mut rx, "p", Duration::from_secs(1)).await);
        assert!(!settle_after_interrupt(&mut rx, "p", Duration::from_millis(20)).await);
    }
}
