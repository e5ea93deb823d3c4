//! One long-lived interpreter process and its message channel
//!
//! # Architecture
//!
//! ```text
//!            requests (mpsc)         stdin (JSON lines)
//! submit() ───────────────▶ writer ───────────────▶ ┌──────────────┐
//!                                                   │  python -u   │
//! events() ◀─────────────── reader ◀─────────────── │  driver.py   │
//!            iopub (mpsc)            stdout          └──────────────┘
//!                                                    stderr → tracing
//! interrupt() ── SIGINT ─────────────────────────────────▲
//! ```
//!
//! The driver routes the interpreter's own stdout to stderr, so the protocol
//! stream cannot be corrupted by code that writes to file descriptor 1.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::protocol::{ExecutionState, KernelEvent, KernelMessage};
use super::KernelError;

/// Python program the interpreter runs to speak the protocol
pub const DRIVER: &str = include_str!("driver.py");

/// Injected once after start
pub const SETUP_CODE: &str = r#"import os
os.environ.setdefault("MPLBACKEND", "Agg")
try:
    import matplotlib
    matplotlib.use("Agg")
    import matplotlib.pyplot as plt
    plt.rcParams["font.sans-serif"] = ["SimHei", "DejaVu Sans", "Arial Unicode MS"]
    plt.rcParams["axes.unicode_minus"] = False
    plt.show = lambda *args, **kwargs: None
except ImportError:
    pass
"#;

/// Receiving half of the kernel's output stream
pub type EventReceiver = mpsc::UnboundedReceiver<KernelMessage>;

/// Out-of-band control over the process behind a session
#[async_trait]
pub trait KernelControl: Send + Sync {
    /// Interrupt the running cell; the kernel must stay usable
    fn interrupt(&self) -> Result<(), KernelError>;

    /// Terminate the kernel
    async fn shutdown(&self) -> Result<(), KernelError>;
}

/// Signals and reaps a child interpreter process
struct ProcessControl {
    pid: Option<u32>,
    child: Mutex<Child>,
}

#[async_trait]
impl KernelControl for ProcessControl {
    fn interrupt(&self) -> Result<(), KernelError> {
        let pid = self.pid.ok_or(KernelError::Disconnected)?;
        kill(Pid::from_raw(pid as i32), Signal::SIGINT)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        let mut child = self.child.lock().await;
        match timeout(Duration::from_secs(2), child.wait()).await {
            Ok(status) => {
                debug!(pid = ?self.pid, status = ?status.ok(), "kernel exited");
            }
            Err(_) => {
                child.start_kill()?;
                let _ = child.wait().await;
                debug!(pid = ?self.pid, "kernel killed");
            }
        }
        Ok(())
    }
}

/// A running kernel
pub struct KernelSession {
    interpreter: String,
    requests: mpsc::Sender<KernelMessage>,
    iopub: Mutex<EventReceiver>,
    control: Box<dyn KernelControl>,
}

impl KernelSession {
    /// Wrap an already-connected transport
    ///
    /// `requests` carries host → kernel messages, `iopub` kernel → host.
    pub fn from_transport(
        interpreter: impl Into<String>,
        requests: mpsc::Sender<KernelMessage>,
        iopub: EventReceiver,
        control: Box<dyn KernelControl>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            requests,
            iopub: Mutex::new(iopub),
            control,
        }
    }

    /// Start `interpreter` running the embedded driver
    pub fn spawn(interpreter: &str) -> Result<Self, KernelError> {
        let mut child = Command::new(interpreter)
            .args(["-u", "-c", DRIVER])
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUTF8", "1")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| KernelError::Spawn {
                interpreter: interpreter.to_string(),
                source,
            })?;

        let pid = child.id();
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(KernelError::Disconnected);
        };

        let (request_tx, mut request_rx) = mpsc::channel::<KernelMessage>(32);
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();

        // Writer: requests → stdin
        tokio::spawn(async move {
            while let Some(msg) = request_rx.recv().await {
                let line = msg.to_line();
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(error = %e, "kernel stdin closed");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader: stdout → iopub. Dropping the sender on EOF closes the stream.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<KernelMessage>(&line) {
                    Ok(msg) => {
                        if iopub_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line, "undecodable kernel message"),
                }
            }
            debug!(pid = ?pid, "kernel stdout closed");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "codevisor::kernel::stderr", pid = ?pid, "{}", line);
            }
        });

        info!(interpreter, pid = ?pid, "kernel process started");

        Ok(Self::from_transport(
            interpreter,
            request_tx,
            iopub_rx,
            Box::new(ProcessControl {
                pid,
                child: Mutex::new(child),
            }),
        ))
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Send code for execution; returns the correlation id
    pub async fn submit(&self, code: &str) -> Result<String, KernelError> {
        let msg = KernelMessage::execute_request(code);
        let id = msg.msg_id().to_string();
        self.requests
            .send(msg)
            .await
            .map_err(|_| KernelError::Disconnected)?;
        Ok(id)
    }

    /// Exclusive access to the kernel's output stream
    ///
    /// Holding the guard across submit and drain is what serializes
    /// executions on one kernel.
    pub async fn events(&self) -> MutexGuard<'_, EventReceiver> {
        self.iopub.lock().await
    }

    /// Wait for the ready handshake
    pub async fn wait_for_ready(&self, wait: Duration) -> Result<(), KernelError> {
        let mut events = self.events().await;
        let request = KernelMessage::kernel_info_request();
        let request_id = request.msg_id().to_string();
        self.requests
            .send(request)
            .await
            .map_err(|_| KernelError::Disconnected)?;

        let deadline = Instant::now() + wait;
        loop {
            let msg = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    return Err(KernelError::NotReady {
                        interpreter: self.interpreter.clone(),
                        waited: wait,
                    })
                }
                Ok(None) => return Err(KernelError::Disconnected),
                Ok(Some(msg)) => msg,
            };
            if msg.parent_id() == Some(request_id.as_str())
                && msg.event() == KernelEvent::KernelInfo
            {
                return Ok(());
            }
        }
    }

    /// Run setup code and wait for it to finish; errors are logged, not fatal
    pub async fn run_setup(&self, code: &str, wait: Duration) -> Result<(), KernelError> {
        let mut events = self.events().await;
        let id = self.submit(code).await?;
        let deadline = Instant::now() + wait;
        loop {
            let msg = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    warn!(interpreter = %self.interpreter, "setup code did not finish in time");
                    return Ok(());
                }
                Ok(None) => return Err(KernelError::Disconnected),
                Ok(Some(msg)) => msg,
            };
            if msg.parent_id() != Some(id.as_str()) {
                continue;
            }
            match msg.event() {
                KernelEvent::Error { ename, evalue, .. } => {
                    warn!(%ename, %evalue, "kernel setup code raised");
                }
                KernelEvent::Status(ExecutionState::Idle) => return Ok(()),
                _ => {}
            }
        }
    }

    pub fn interrupt(&self) -> Result<(), KernelError> {
        self.control.interrupt()
    }

    /// Ask the kernel to exit, then make sure it did
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        let _ = self.requests.send(KernelMessage::shutdown_request()).await;
        self.control.shutdown().await
    }
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopControl;

    #[async_trait]
    impl KernelControl for NoopControl {
        fn interrupt(&self) -> Result<(), KernelError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), KernelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_returns_request_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let session = KernelSession::from_transport("fake", tx, iopub_rx, Box::new(NoopControl));

        let id = session.submit("x = 1").await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.msg_id(), id);
        assert_eq!(sent.code(), Some("x = 1"));
    }

    #[tokio::test]
    async fn test_wait_for_ready_matches_reply() {
        let (tx, mut rx) = mpsc::channel(4);
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let session = KernelSession::from_transport("fake", tx, iopub_rx, Box::new(NoopControl));

        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            // An unrelated message first
            iopub_tx
                .send(KernelMessage::display_data("other", json!({})))
                .unwrap();
            iopub_tx
                .send(KernelMessage::kernel_info_reply(request.msg_id()))
                .unwrap();
        });

        session
            .wait_for_ready(Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let (tx, _rx) = mpsc::channel(4);
        let (_iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let session = KernelSession::from_transport("fake", tx, iopub_rx, Box::new(NoopControl));

        let err = session
            .wait_for_ready(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_closed_transport_is_disconnected() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let (_iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let session = KernelSession::from_transport("fake", tx, iopub_rx, Box::new(NoopControl));
        assert!(matches!(
            session.submit("1").await,
            Err(KernelError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_spawn_missing_interpreter() {
        let err = KernelSession::spawn("/nonexistent/python-does-not-exist").unwrap_err();
        assert!(matches!(err, KernelError::Spawn { .. }));
    }
}
