//! Execution engine: registry + tracker + dispatch
//!
//! `execute` returns as soon as the execution is registered; a background
//! task acquires the conversation's kernel, submits the code and drains the
//! replies. Callers poll `status` or await `wait`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::dispatch::{drain_execution, settle_after_interrupt, DispatchOptions, DispatchOutcome};
use super::tracker::{Execution, ExecutionStatus, ExecutionTracker};
use crate::config::ExecutionConfig;
use crate::events::{Event, EventSink, EventType};
use crate::kernel::{KernelRegistry, KernelSession};
use crate::llm::ImageAnalyzer;
use crate::metrics::{CODE_EXECUTIONS, CODE_EXECUTION_DURATION};

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub max_execution: Duration,
    pub poll_interval: Duration,
    /// How long to wait for an interrupted cell to reach idle
    pub settle_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for EngineOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_execution: config.max_execution(),
            poll_interval: config.poll_interval(),
            settle_grace: Duration::from_secs(5),
        }
    }
}

pub struct ExecutionEngine {
    registry: Arc<KernelRegistry>,
    tracker: Arc<ExecutionTracker>,
    sink: Arc<dyn EventSink>,
    options: EngineOptions,
    vision: ImageAnalyzer,
    tasks: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// Everything the background task needs
struct ExecutionTask {
    execution_id: String,
    conversation_id: String,
    code: String,
    registry: Arc<KernelRegistry>,
    tracker: Arc<ExecutionTracker>,
    sink: Arc<dyn EventSink>,
    options: EngineOptions,
    vision: ImageAnalyzer,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<KernelRegistry>,
        sink: Arc<dyn EventSink>,
        options: EngineOptions,
    ) -> Self {
        Self {
            registry,
            tracker: Arc::new(ExecutionTracker::new()),
            sink,
            options,
            vision: ImageAnalyzer::unconfigured(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Describe captured figures with `vision` before an execution settles
    pub fn with_vision(mut self, vision: ImageAnalyzer) -> Self {
        self.vision = vision;
        self
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Start executing `code` for a conversation; returns the execution id
    ///
    /// With a workspace, the kernel changes into it before running the code.
    pub async fn execute(
        &self,
        conversation_id: &str,
        code: &str,
        workspace: Option<&Path>,
    ) -> String {
        let execution_id = self.tracker.register(conversation_id, code).await;
        self.sink.emit(Event::for_execution(
            EventType::CodeExecutionStart,
            conversation_id,
            &execution_id,
            json!({ "code": code }),
        ));

        let cancel = CancellationToken::new();
        lock_tasks(&self.tasks).insert(execution_id.clone(), cancel.clone());

        let task = ExecutionTask {
            execution_id: execution_id.clone(),
            conversation_id: conversation_id.to_string(),
            code: with_workspace(code, workspace),
            registry: self.registry.clone(),
            tracker: self.tracker.clone(),
            sink: self.sink.clone(),
            options: self.options,
            vision: self.vision.clone(),
            cancel,
        };
        let tasks = self.tasks.clone();
        let span = info_span!(
            "code_execution",
            execution_id = %execution_id,
            conversation_id = %conversation_id,
            code_len = code.len(),
            otel.name = "code_execution"
        );
        tokio::spawn(
            async move {
                let id = task.execution_id.clone();
                task.run().await;
                lock_tasks(&tasks).remove(&id);
            }
            .instrument(span),
        );

        execution_id
    }

    /// Cancel a pending or running execution
    ///
    /// Returns false if it already settled or does not exist.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        if !self.tracker.cancel(execution_id).await {
            return false;
        }
        if let Some(token) = lock_tasks(&self.tasks).get(execution_id) {
            token.cancel();
        }
        info!(execution_id, "execution cancelled");
        true
    }

    pub async fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.tracker.status(execution_id).await
    }

    pub async fn snapshot(&self, execution_id: &str) -> Option<Execution> {
        self.tracker.snapshot(execution_id).await
    }

    /// Wait for the execution to settle
    pub async fn wait(&self, execution_id: &str) -> Option<Execution> {
        self.tracker.wait(execution_id).await
    }

    /// Interpreter used for a conversation, if its kernel is running
    pub async fn interpreter_for(&self, conversation_id: &str) -> Option<String> {
        self.registry
            .existing(conversation_id)
            .await
            .map(|session| session.interpreter().to_string())
    }

    /// Cancel everything in flight and stop all kernels
    pub async fn shutdown(&self) {
        let ids: Vec<String> = lock_tasks(&self.tasks).keys().cloned().collect();
        for id in ids {
            self.cancel(&id).await;
        }
        self.registry.shutdown_all().await;
    }
}

impl ExecutionTask {
    async fn run(self) {
        let started = Instant::now();
        self.drive().await;

        let record = match self.tracker.snapshot(&self.execution_id).await {
            Some(record) => record,
            None => return,
        };

        for (index, image) in record.images.iter().enumerate() {
            self.emit(
                EventType::CodeExecutionImage,
                json!({
                    "image_index": index,
                    "data": image.data,
                    "format": image.format,
                    "image_description": image.description,
                }),
            );
        }
        self.emit(
            EventType::CodeExecutionEnd,
            json!({
                "status": record.status,
                "error": record.error,
                "image_count": record.images.len(),
                "execution_count": record.execution_count,
            }),
        );

        CODE_EXECUTIONS
            .with_label_values(&[record.status.as_str()])
            .inc();
        CODE_EXECUTION_DURATION.observe(started.elapsed().as_secs_f64());
        info!(
            status = %record.status,
            outputs = record.output.len(),
            images = record.images.len(),
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "execution settled"
        );
    }

    async fn drive(&self) {
        let id = self.execution_id.as_str();

        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            acquired = self.registry.session(&self.conversation_id) => match acquired {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "kernel unavailable");
                    self.tracker.abort(id, format!("kernel unavailable: {e}")).await;
                    return;
                }
            },
        };

        // Waiting here is how executions queue behind each other on one kernel
        let mut events = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            guard = session.events() => guard,
        };

        let correlation_id = match session.submit(&self.code).await {
            Ok(msg_id) => msg_id,
            Err(e) => {
                self.tracker.abort(id, format!("failed to submit code: {e}")).await;
                self.registry.discard(&self.conversation_id, &session).await;
                return;
            }
        };

        let options = DispatchOptions {
            poll_interval: self.options.poll_interval,
            deadline: TokioInstant::now() + self.options.max_execution,
        };
        let outcome = drain_execution(
            &mut events,
            &correlation_id,
            id,
            &self.tracker,
            &self.cancel,
            options,
            |item| {
                self.emit(
                    EventType::CodeExecutionOutput,
                    json!({
                        "kind": item.kind,
                        "content": item.content,
                        "timestamp": item.timestamp.to_rfc3339(),
                    }),
                )
            },
        )
        .await;

        match outcome {
            DispatchOutcome::Idle => {
                self.describe_images().await;
                self.tracker.finish(id).await;
            }
            DispatchOutcome::Cancelled => {
                self.interrupt(&session, &mut events, &correlation_id).await;
            }
            DispatchOutcome::TimedOut => {
                self.interrupt(&session, &mut events, &correlation_id).await;
                let message = format!(
                    "execution timed out after {}s",
                    self.options.max_execution.as_secs()
                );
                self.describe_images().await;
                self.tracker.abort(id, message).await;
            }
            DispatchOutcome::Disconnected => {
                self.describe_images().await;
                self.tracker.abort(id, "kernel connection closed").await;
                drop(events);
                self.registry.discard(&self.conversation_id, &session).await;
            }
        }
    }

    /// Runs while the execution is still open, so `wait` sees the descriptions
    async fn describe_images(&self) {
        let Some(record) = self.tracker.snapshot(&self.execution_id).await else {
            return;
        };
        for (index, image) in record.images.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return;
            }
            let description = self.vision.describe(&image.data, &image.format).await;
            self.tracker
                .describe_image(&self.execution_id, index, description)
                .await;
        }
    }

    async fn interrupt(
        &self,
        session: &KernelSession,
        events: &mut crate::kernel::EventReceiver,
        correlation_id: &str,
    ) {
        if let Err(e) = session.interrupt() {
            warn!(error = %e, "failed to interrupt kernel");
            return;
        }
        if !settle_after_interrupt(events, correlation_id, self.options.settle_grace).await {
            warn!("interrupted kernel did not go idle in time");
        }
    }

    fn emit(&self, event_type: EventType, data: serde_json::Value) {
        self.sink.emit(Event::for_execution(
            event_type,
            &self.conversation_id,
            &self.execution_id,
            data,
        ));
    }
}

/// Prefix `code` with a change into `workspace`
///
/// The directory is passed as a JSON string literal, which Python parses as
/// the same string.
pub fn with_workspace(code: &str, workspace: Option<&Path>) -> String {
    match workspace {
        Some(dir) => {
            let literal = serde_json::Value::String(dir.to_string_lossy().into_owned());
            format!("__import__('os').chdir({literal})\n{code}")
        }
        None => code.to_string(),
    }
}

fn lock_tasks(
    tasks: &Mutex<HashMap<String, CancellationToken>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
