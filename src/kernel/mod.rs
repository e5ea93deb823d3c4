//! Interpreter kernels
//!
//! A kernel is a long-lived Python process that runs submitted code and
//! streams back typed protocol messages. This module owns starting kernels,
//! talking to them, and mapping conversations onto them.

pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod session;

use std::time::Duration;

use thiserror::Error;

pub use launcher::{KernelLauncher, ProcessLauncher};
pub use protocol::{ExecutionState, KernelEvent, KernelMessage, StreamName};
pub use registry::{KernelPoolMode, KernelRegistry, SHARED_KEY};
pub use session::{EventReceiver, KernelControl, KernelSession, DRIVER, SETUP_CODE};

/// Error type for kernel operations
#[derive(Debug, Error)]
pub enum KernelError {
    /// The interpreter (and its fallback) could not be started
    #[error("kernel startup failed for {interpreter}: {reason}")]
    Startup { interpreter: String, reason: String },
    #[error("failed to spawn {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{interpreter} did not answer kernel_info within {waited:?}")]
    NotReady { interpreter: String, waited: Duration },
    #[error("kernel connection closed")]
    Disconnected,
    #[error("failed to signal kernel: {0}")]
    Signal(#[from] nix::errno::Errno),
    #[error("kernel I/O error: {0}")]
    Io(#[from] std::io::Error),
}
