//! Agent Controller - entry point for running a task in a conversation
//!
//! Builds the right agent loops for the requested mode, wires them to the
//! tool executor and execution engine, and keeps each conversation's
//! single-agent transcript between turns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::dual::{DualAgentController, MAX_REACT_ROUNDS};
use super::prompts::DEFAULT_SYSTEM_PROMPT;
use super::runner::{AgentError, AgentLoop, AgentProfile, DEFAULT_MAX_TOOL_ROUNDS};
use crate::config::Config;
use crate::events::EventSink;
use crate::execution::ExecutionEngine;
use crate::llm::{ChatMessage, ChatModel};
use crate::metrics::AGENT_TASKS;
use crate::tools::{ToolContext, ToolExecutor, Workspace};

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tool-call rounds allowed within one agent step
    pub max_tool_rounds: usize,
    /// Custom system prompt for the tool-using agent (uses default if None)
    pub system_prompt: Option<String>,
    /// Interpreter used for package installs before a kernel exists
    pub interpreter: String,
    pub install_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            system_prompt: None,
            interpreter: "python3".to_string(),
            install_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&Config> for AgentConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_tool_rounds: config.agent.max_tool_rounds,
            system_prompt: config.agent.system_prompt.clone(),
            interpreter: config.kernel.interpreter.clone(),
            install_timeout: config.execution.install_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// One tool-using assistant
    Single,
    /// Planner + executor ReAct cycle
    Dual,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Single => "single",
            AgentMode::Dual => "dual",
        }
    }
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub final_response: String,
    /// Model calls (single) or executor rounds (dual)
    pub iterations: usize,
    pub tool_calls_made: usize,
    /// Unique trace ID for this agent run
    pub trace_id: String,
    /// False when a dual run ended on the round cap
    pub completed: bool,
}

pub struct AgentController {
    model: Arc<dyn ChatModel>,
    planner_model: Arc<dyn ChatModel>,
    engine: Arc<ExecutionEngine>,
    sink: Arc<dyn EventSink>,
    workspace: Option<Workspace>,
    config: AgentConfig,
    /// One slot per conversation; holding a slot serializes its turns
    transcripts: Mutex<HashMap<String, Arc<Mutex<Vec<ChatMessage>>>>>,
}

impl AgentController {
    pub fn new(
        model: Arc<dyn ChatModel>,
        engine: Arc<ExecutionEngine>,
        sink: Arc<dyn EventSink>,
        config: AgentConfig,
    ) -> Self {
        Self {
            planner_model: model.clone(),
            model,
            engine,
            sink,
            workspace: None,
            config,
            transcripts: Mutex::new(HashMap::new()),
        }
    }

    /// Use a different model for the planner role
    pub fn with_planner_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.planner_model = model;
        self
    }

    pub fn with_workspace(mut self, workspace: Workspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    fn tools(&self, conversation_id: &str) -> ToolExecutor {
        ToolExecutor::new(ToolContext {
            conversation_id: conversation_id.to_string(),
            workspace: self.workspace.clone(),
            engine: self.engine.clone(),
            interpreter: self.config.interpreter.clone(),
            install_timeout: self.config.install_timeout,
        })
    }

    fn tool_profile(&self, base: AgentProfile) -> AgentProfile {
        let prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        base.with_system_prompt(prompt)
            .with_max_tool_rounds(self.config.max_tool_rounds)
    }

    /// Run a task in a conversation
    pub async fn run(
        &self,
        conversation_id: &str,
        task: &str,
        mode: AgentMode,
    ) -> Result<AgentResult, AgentError> {
        let trace_id = Uuid::now_v7().to_string();

        let root_span = info_span!(
            "agent_task",
            trace_id = %trace_id,
            conversation_id = %conversation_id,
            mode = mode.as_str(),
            model = %self.model.model_name(),
            otel.name = "agent_task"
        );

        async {
            info!(trace_id = %trace_id, task = %task, "Starting agent task");

            let result = match mode {
                AgentMode::Single => self.run_single(conversation_id, task, &trace_id).await,
                AgentMode::Dual => self.run_dual(conversation_id, task, &trace_id).await,
            };

            let outcome = match &result {
                Ok(r) if r.completed => "success",
                Ok(_) => "exhausted",
                Err(_) => "error",
            };
            AGENT_TASKS
                .with_label_values(&[mode.as_str(), outcome])
                .inc();

            match &result {
                Ok(r) => info!(
                    trace_id = %trace_id,
                    iterations = r.iterations,
                    tool_calls = r.tool_calls_made,
                    outcome,
                    "Agent task finished"
                ),
                Err(e) => warn!(trace_id = %trace_id, error = %e, "Agent task failed"),
            }
            result
        }
        .instrument(root_span)
        .await
    }

    async fn run_single(
        &self,
        conversation_id: &str,
        task: &str,
        trace_id: &str,
    ) -> Result<AgentResult, AgentError> {
        let slot = self
            .transcripts
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        let mut history = slot.lock().await;
        let previous = std::mem::take(&mut *history);

        let mut agent = AgentLoop::new(
            self.tool_profile(AgentProfile::assistant()),
            self.model.clone(),
            self.sink.clone(),
            conversation_id,
        )
        .with_tools(self.tools(conversation_id))
        .with_transcript(previous);

        let answer = agent.step(task).await;
        let iterations = agent.model_calls();
        let tool_calls_made = agent.tool_calls_made();
        *history = agent.into_transcript();
        drop(history);

        Ok(AgentResult {
            final_response: answer?,
            iterations,
            tool_calls_made,
            trace_id: trace_id.to_string(),
            completed: true,
        })
    }

    async fn run_dual(
        &self,
        conversation_id: &str,
        goal: &str,
        trace_id: &str,
    ) -> Result<AgentResult, AgentError> {
        let planner = AgentLoop::new(
            AgentProfile::planner(),
            self.planner_model.clone(),
            self.sink.clone(),
            conversation_id,
        );
        let executor = AgentLoop::new(
            self.tool_profile(AgentProfile::executor()),
            self.model.clone(),
            self.sink.clone(),
            conversation_id,
        )
        .with_tools(self.tools(conversation_id));

        let mut dual =
            DualAgentController::new(planner, executor, self.sink.clone(), conversation_id);
        let outcome = dual.run(goal).await?;
        if !outcome.completed {
            info!(trace_id = %trace_id, rounds = MAX_REACT_ROUNDS, "ReAct cycle exhausted");
        }

        Ok(AgentResult {
            final_response: outcome.final_response,
            iterations: outcome.iterations,
            tool_calls_made: outcome.tool_calls_made,
            trace_id: trace_id.to_string(),
            completed: outcome.completed,
        })
    }

    /// Transcript kept for a conversation's single-agent turns
    ///
    /// Waits for a turn in progress to finish.
    pub async fn transcript(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let slot = self.transcripts.lock().await.get(conversation_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Forget a conversation: drop its transcript and reap its kernel
    pub async fn end_conversation(&self, conversation_id: &str) {
        self.transcripts.lock().await.remove(conversation_id);
        if self.engine.registry().reap(conversation_id).await {
            info!(conversation_id, "kernel reaped");
        }
    }
}
