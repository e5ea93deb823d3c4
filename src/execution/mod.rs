//! Code execution on kernels
//!
//! # Architecture
//!
//! ```text
//! execute(conv, code) ──▶ ExecutionTracker.register ──▶ code_execution_start
//!        │
//!        └─▶ task: KernelRegistry.session(conv)
//!                  lock events ─▶ submit ─▶ drain_execution ─┬─ idle       → finish
//!                                                            ├─ cancelled  → interrupt
//!                                                            ├─ deadline   → interrupt + error
//!                                                            └─ closed     → error, discard kernel
//!                  code_execution_image × n, code_execution_end
//! ```

pub mod dispatch;
pub mod engine;
pub mod tracker;

pub use dispatch::{drain_execution, DispatchOptions, DispatchOutcome};
pub use engine::{with_workspace, EngineOptions, ExecutionEngine};
pub use tracker::{
    CapturedImage, Execution, ExecutionStatus, ExecutionTracker, OutputItem, OutputKind,
    CANCELLED_MESSAGE,
};
