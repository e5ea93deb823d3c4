//! LLM integration
//!
//! Chat message types with tool calling, a client for OpenAI-compatible
//! `/chat/completions` endpoints, and image descriptions from a vision model.

pub mod client;
pub mod tool_use;
pub mod vision;

pub use client::{ChatClient, ChatError, ChatModel};
pub use tool_use::{ChatMessage, ChatResponse, FunctionCall, Role, Tool, ToolCall, ToolFunction};
pub use vision::{ImageAnalyzer, CHART_PROMPT, VISION_NOT_CONFIGURED};
