//! CodeVisor - LLM agents driving a persistent Python kernel
//!
//! A conversational agent (or a planner + executor pair) calls tools that
//! read a workspace and run code in a long-lived interpreter. Kernel
//! protocol messages become an ordered, typed output stream per execution,
//! and everything worth rendering is published as structured events.
//!
//! # Modules
//!
//! - `agent` - single-agent loop, dual-agent ReAct cycle, transcript helpers
//! - `tools` - tool schemas and the executor (directory, files, code, pip)
//! - `execution` - execution tracker, dispatch loop and engine
//! - `kernel` - kernel wire protocol, sessions, launcher and registry
//! - `llm` - OpenAI-compatible chat client and image descriptions
//! - `events` - event envelope and sinks
//! - `config` - JSON configuration with environment overrides
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - logging and optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use codevisor::{AgentController, AgentMode, Config};
//!
//! let config = Config::from_sources(None)?;
//! let controller = codevisor::build_controller(&config, Arc::new(LogSink))?;
//! let result = controller.run("conv-1", "Summarize sales.csv", AgentMode::Single).await?;
//! ```

use std::sync::Arc;

pub mod agent;
pub mod config;
pub mod events;
pub mod execution;
pub mod kernel;
pub mod llm;
pub mod metrics;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, AgentError, AgentMode, AgentResult};
pub use config::Config;
pub use events::{Event, EventSink, EventType};
pub use execution::{EngineOptions, ExecutionEngine};
pub use kernel::{KernelRegistry, ProcessLauncher};
pub use llm::{ChatClient, ImageAnalyzer};

/// Execution engine backed by real interpreter processes
pub fn build_engine(config: &Config, sink: Arc<dyn EventSink>) -> Arc<ExecutionEngine> {
    let launcher = Arc::new(ProcessLauncher::new(&config.kernel));
    let registry = Arc::new(KernelRegistry::new(config.kernel.pool_mode, launcher));
    let vision = match config.vision_model() {
        Some(model) => ImageAnalyzer::new(Arc::new(ChatClient::new(model))),
        None => ImageAnalyzer::unconfigured(),
    };
    Arc::new(
        ExecutionEngine::new(registry, sink, EngineOptions::from(&config.execution))
            .with_vision(vision),
    )
}

/// Agent controller wired from configuration
pub fn build_controller(
    config: &Config,
    sink: Arc<dyn EventSink>,
) -> std::io::Result<AgentController> {
    let engine = build_engine(config, sink.clone());
    let mut controller = AgentController::new(
        Arc::new(ChatClient::new(&config.model)),
        engine,
        sink,
        AgentConfig::from(config),
    )
    .with_planner_model(Arc::new(ChatClient::new(&config.planner_model())));
    if let Some(root) = &config.workspace {
        controller = controller.with_workspace(tools::Workspace::new(root)?);
    }
    Ok(controller)
}
