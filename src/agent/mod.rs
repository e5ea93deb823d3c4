//! Agent orchestration
//!
//! # Architecture
//!
//! ```text
//! AgentController.run(conv, task, mode)
//!     │
//!     ├─ Single: AgentLoop(assistant) ── model ⇄ ToolExecutor ──▶ answer, done
//!     │
//!     └─ Dual:   DualAgentController
//!                  planner  AgentLoop(no tools, fresh transcript)
//!                  executor AgentLoop(tools, minimal tool chain)
//!                  plan → act → observe → replan, ≤ 5 rounds ──▶ answer, done
//! ```

pub mod controller;
pub mod dual;
pub mod prompts;
pub mod runner;
pub mod transcript;

pub use controller::{AgentConfig, AgentController, AgentMode, AgentResult};
pub use dual::{DualAgentController, DualAgentState, DualOutcome, ReactPhase, MAX_REACT_ROUNDS};
pub use prompts::{
    contains_completion_marker, max_rounds_fallback, render_planner_prompt,
    COMPLETION_MARKERS, DEFAULT_SYSTEM_PROMPT, PLANNER_SYSTEM_PROMPT,
};
pub use runner::{AgentError, AgentLoop, AgentProfile, AgentRole, DEFAULT_MAX_TOOL_ROUNDS};
pub use transcript::{
    rebuild_minimal_tool_chain, validate_tool_pairing, ResetPolicy, TranscriptError,
};
