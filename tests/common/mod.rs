//! Shared fakes for integration tests
//!
//! - `ScriptedModel`: a `ChatModel` that replays canned replies
//! - `FakeKernel`: an in-process kernel speaking the wire protocol
//! - `FakeLauncher`: hands out fake kernels and counts launches

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use codevisor::events::{EventSink, MemorySink};
use codevisor::execution::{EngineOptions, ExecutionEngine};
use codevisor::kernel::{
    ExecutionState, KernelControl, KernelError, KernelLauncher, KernelMessage, KernelPoolMode,
    KernelRegistry, KernelSession, StreamName,
};
use codevisor::llm::{
    ChatError, ChatMessage, ChatModel, ChatResponse, ImageAnalyzer, Tool, ToolCall,
};

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

/// Replays replies in order and records every request
pub struct ScriptedModel {
    name: String,
    replies: Mutex<Vec<ChatMessage>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    images: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(name: &str, replies: Vec<ChatMessage>) -> Arc<Self> {
        Self::build(name, replies, None)
    }

    /// Sleeps before every reply so concurrent callers interleave
    pub fn slow(name: &str, replies: Vec<ChatMessage>, delay: Duration) -> Arc<Self> {
        Self::build(name, replies, Some(delay))
    }

    fn build(name: &str, replies: Vec<ChatMessage>, delay: Option<Duration>) -> Arc<Self> {
        let mut replies = replies;
        replies.reverse();
        Arc::new(Self {
            name: name.to_string(),
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            delay,
        })
    }

    /// Image URLs passed to `describe_image`
    pub fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[Tool],
    ) -> Result<ChatResponse, ChatError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.replies.lock().unwrap().pop() {
            Some(message) => Ok(ChatResponse::new(message)),
            None => Err(ChatError::EmptyResponse),
        }
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    async fn describe_image(&self, image_url: &str, _prompt: &str) -> Result<String, ChatError> {
        let mut images = self.images.lock().unwrap();
        images.push(image_url.to_string());
        Ok(format!("{} saw figure {}", self.name, images.len()))
    }
}

pub fn tool_call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall::new(id, name, &args)
}

pub fn calls_tools(content: &str, calls: Vec<ToolCall>) -> ChatMessage {
    ChatMessage::assistant_with_tools(content, calls)
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel
// ─────────────────────────────────────────────────────────────────────────────

/// In-process kernel driven by a tiny line language:
///
/// ```text
/// print <text>       stdout "<text>\n"
/// eprint <text>      stderr "<text>\n"
/// result <text>      execute_result text/plain
/// image              display_data image/png
/// raise <Name> <msg> error, stops the cell
/// sleep <ms>         interruptible sleep (KeyboardInterrupt)
/// set <k> <v>        store a variable
/// get <k>            stdout "<value>\n"
/// ```
///
/// Any other line is ignored.
pub struct FakeKernel;

#[derive(Default)]
pub struct FakeControl {
    interrupt: Arc<Notify>,
    pub interrupts: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl KernelControl for FakeControl {
    fn interrupt(&self) -> Result<(), KernelError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupt.notify_one();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub const PNG: &str = "iVBORw0KGgo=";

impl FakeKernel {
    pub fn session(name: &str) -> KernelSession {
        let (request_tx, mut request_rx) = mpsc::channel::<KernelMessage>(16);
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let control = FakeControl::default();
        let interrupt = control.interrupt.clone();

        tokio::spawn(async move {
            let mut vars: HashMap<String, String> = HashMap::new();
            let mut count = 0u64;
            while let Some(request) = request_rx.recv().await {
                let parent = request.msg_id().to_string();
                match request.msg_type() {
                    "execute_request" => {
                        count += 1;
                        let code = request.code().unwrap_or_default().to_string();
                        let send = |m: KernelMessage| {
                            let _ = iopub_tx.send(m);
                        };
                        send(KernelMessage::status(&parent, ExecutionState::Busy));
                        send(KernelMessage::execute_input(&parent, &code, count));
                        run_cell(&code, &parent, count, &mut vars, &interrupt, &send).await;
                        send(KernelMessage::status(&parent, ExecutionState::Idle));
                    }
                    "kernel_info_request" => {
                        let _ = iopub_tx.send(KernelMessage::kernel_info_reply(&parent));
                    }
                    "shutdown_request" => break,
                    _ => {}
                }
            }
        });

        KernelSession::from_transport(name, request_tx, iopub_rx, Box::new(control))
    }

    /// A session whose kernel is already gone
    pub fn dead(name: &str) -> KernelSession {
        let (request_tx, request_rx) = mpsc::channel::<KernelMessage>(16);
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel::<KernelMessage>();
        // Accept requests but never answer, then hang up
        tokio::spawn(async move {
            let mut request_rx = request_rx;
            let _ = request_rx.recv().await;
            drop(iopub_tx);
        });
        KernelSession::from_transport(name, request_tx, iopub_rx, Box::new(FakeControl::default()))
    }
}

async fn run_cell(
    code: &str,
    parent: &str,
    count: u64,
    vars: &mut HashMap<String, String>,
    interrupt: &Notify,
    send: &impl Fn(KernelMessage),
) {
    for line in code.lines() {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "print" => send(KernelMessage::stream(parent, StreamName::Stdout, &format!("{rest}\n"))),
            "eprint" => send(KernelMessage::stream(parent, StreamName::Stderr, &format!("{rest}\n"))),
            "result" => send(KernelMessage::execute_result(
                parent,
                count,
                json!({ "text/plain": rest }),
            )),
            "image" => send(KernelMessage::display_data(
                parent,
                json!({ "image/png": PNG, "text/plain": "<Figure>" }),
            )),
            "raise" => {
                let (ename, evalue) = rest.split_once(' ').unwrap_or((rest, ""));
                let traceback = vec![
                    "Traceback (most recent call last):".to_string(),
                    format!("{ename}: {evalue}"),
                ];
                send(KernelMessage::error(parent, ename, evalue, &traceback));
                return;
            }
            "sleep" => {
                let ms = rest.trim().parse().unwrap_or(0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = interrupt.notified() => {
                        let traceback = vec!["KeyboardInterrupt: ".to_string()];
                        send(KernelMessage::error(parent, "KeyboardInterrupt", "", &traceback));
                        return;
                    }
                }
            }
            "set" => {
                let (key, value) = rest.split_once(' ').unwrap_or((rest, ""));
                vars.insert(key.to_string(), value.to_string());
            }
            "get" => {
                let value = vars
                    .get(rest.trim())
                    .cloned()
                    .unwrap_or_else(|| "<undefined>".to_string());
                send(KernelMessage::stream(parent, StreamName::Stdout, &format!("{value}\n")));
            }
            _ => {}
        }
    }
}

/// Launches fake kernels, optionally failing
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    fail: bool,
    dead: bool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            fail: false,
            dead: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            fail: true,
            dead: false,
        })
    }

    /// Hands out kernels that die on first request
    pub fn dying() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            fail: false,
            dead: true,
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelLauncher for FakeLauncher {
    async fn launch(&self) -> Result<KernelSession, KernelError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KernelError::Startup {
                interpreter: "fake".to_string(),
                reason: "refusing to start".to_string(),
            });
        }
        let name = format!("fake-{n}");
        if self.dead {
            Ok(FakeKernel::dead(&name))
        } else {
            Ok(FakeKernel::session(&name))
        }
    }
}

pub fn fast_options() -> EngineOptions {
    EngineOptions {
        max_execution: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
        settle_grace: Duration::from_secs(2),
    }
}

/// Engine over fake kernels, plus the sink and launcher it uses
pub fn fake_engine(
    mode: KernelPoolMode,
    options: EngineOptions,
) -> (Arc<ExecutionEngine>, Arc<MemorySink>, Arc<FakeLauncher>) {
    fake_engine_with_vision(mode, options, ImageAnalyzer::unconfigured())
}

pub fn fake_engine_with_vision(
    mode: KernelPoolMode,
    options: EngineOptions,
    vision: ImageAnalyzer,
) -> (Arc<ExecutionEngine>, Arc<MemorySink>, Arc<FakeLauncher>) {
    let launcher = FakeLauncher::new();
    let sink = Arc::new(MemorySink::new());
    let registry = Arc::new(KernelRegistry::new(mode, launcher.clone()));
    let engine = Arc::new(
        ExecutionEngine::new(registry, sink.clone() as Arc<dyn EventSink>, options)
            .with_vision(vision),
    );
    (engine, sink, launcher)
}
