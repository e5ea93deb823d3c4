//! Transcript-driven agent loop
//!
//! One loop implementation serves every role. An [`AgentProfile`] decides the
//! system prompt, how the transcript is reset at the start of each step,
//! whether tools are offered, and which events the final answer produces.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::prompts::{DEFAULT_SYSTEM_PROMPT, PLANNER_SYSTEM_PROMPT};
use super::transcript::{validate_tool_pairing, ResetPolicy, TranscriptError};
use crate::events::{EventSink, EventType};
use crate::llm::{ChatError, ChatMessage, ChatModel, Tool, ToolCall};
use crate::metrics::AGENT_TOOL_CALLS;
use crate::tools::{
    envelope_status, error_envelope, tool_definitions, ToolError, ToolExecutor, ToolKind,
};

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 20;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Model(#[from] ChatError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("transcript is invalid: {0}")]
    Transcript(#[from] TranscriptError),
    #[error("maximum tool rounds ({0}) reached without a final answer")]
    MaxIterationsReached(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Assistant,
    Planner,
    Executor,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Assistant => "assistant",
            AgentRole::Planner => "planner",
            AgentRole::Executor => "executor",
        }
    }
}

/// Everything that distinguishes one agent role from another
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub system_prompt: String,
    pub reset: ResetPolicy,
    pub use_tools: bool,
    /// Event emitted for the final answer of a step
    pub message_event: EventType,
    pub emit_done: bool,
    pub max_tool_rounds: usize,
}

impl AgentProfile {
    /// Single agent: keeps its conversation, uses tools, ends with `done`
    pub fn assistant() -> Self {
        Self {
            role: AgentRole::Assistant,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            reset: ResetPolicy::Keep,
            use_tools: true,
            message_event: EventType::AssistantMessage,
            emit_done: true,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    /// Planner: no tools, a fresh transcript for every plan
    pub fn planner() -> Self {
        Self {
            role: AgentRole::Planner,
            system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
            reset: ResetPolicy::Fresh,
            use_tools: false,
            message_event: EventType::UserAgentMessage,
            emit_done: false,
            max_tool_rounds: 1,
        }
    }

    /// Executor: tools, and only the previous round's tool-call chain survives
    pub fn executor() -> Self {
        Self {
            role: AgentRole::Executor,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            reset: ResetPolicy::MinimalToolChain,
            use_tools: true,
            message_event: EventType::AssistantMessage,
            emit_done: false,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }
}

pub struct AgentLoop {
    profile: AgentProfile,
    model: Arc<dyn ChatModel>,
    tools: Option<ToolExecutor>,
    sink: Arc<dyn EventSink>,
    conversation_id: String,
    transcript: Vec<ChatMessage>,
    tool_calls_made: usize,
    model_calls: usize,
}

impl AgentLoop {
    pub fn new(
        profile: AgentProfile,
        model: Arc<dyn ChatModel>,
        sink: Arc<dyn EventSink>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            profile,
            model,
            tools: None,
            sink,
            conversation_id: conversation_id.into(),
            transcript: Vec::new(),
            tool_calls_made: 0,
            model_calls: 0,
        }
    }

    pub fn with_tools(mut self, tools: ToolExecutor) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Resume from an earlier transcript (used with [`ResetPolicy::Keep`])
    pub fn with_transcript(mut self, transcript: Vec<ChatMessage>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn into_transcript(self) -> Vec<ChatMessage> {
        self.transcript
    }

    pub fn tool_calls_made(&self) -> usize {
        self.tool_calls_made
    }

    pub fn model_calls(&self) -> usize {
        self.model_calls
    }

    fn schemas(&self) -> Vec<Tool> {
        if self.profile.use_tools && self.tools.is_some() {
            tool_definitions()
        } else {
            Vec::new()
        }
    }

    /// Run one user turn to a final answer
    ///
    /// On error the transcript is rolled back to the last valid round
    /// boundary, so the agent can be stepped again.
    pub async fn step(&mut self, user_message: &str) -> Result<String, AgentError> {
        self.transcript = self
            .profile
            .reset
            .apply(&self.profile.system_prompt, &self.transcript);
        self.transcript.push(ChatMessage::user(user_message));

        let schemas = self.schemas();
        let role = self.profile.role.as_str();
        let mut round = 0;

        loop {
            round += 1;
            if round > self.profile.max_tool_rounds {
                warn!(
                    conversation_id = %self.conversation_id,
                    role,
                    rounds = self.profile.max_tool_rounds,
                    "tool round limit reached"
                );
                return Err(AgentError::MaxIterationsReached(
                    self.profile.max_tool_rounds,
                ));
            }

            validate_tool_pairing(&self.transcript)?;
            let checkpoint = self.transcript.len();

            let llm_span = info_span!(
                "llm_call",
                conversation_id = %self.conversation_id,
                role,
                round,
                model = %self.model.model_name(),
                otel.name = "llm_call"
            );
            self.model_calls += 1;
            let response = self
                .model
                .chat(&self.transcript, &schemas)
                .instrument(llm_span)
                .await?;
            let message = response.message;

            if !message.has_tool_calls() || schemas.is_empty() {
                if message.has_tool_calls() {
                    warn!(
                        conversation_id = %self.conversation_id,
                        role,
                        "ignoring tool calls from a profile without tools"
                    );
                }
                return Ok(self.finish(message.content));
            }

            if let Err(e) = self.run_tool_round(message).await {
                self.transcript.truncate(checkpoint);
                return Err(e);
            }
        }
    }

    fn finish(&mut self, answer: String) -> String {
        self.transcript.push(ChatMessage::assistant(answer.clone()));
        info!(
            conversation_id = %self.conversation_id,
            role = self.profile.role.as_str(),
            tool_calls = self.tool_calls_made,
            "agent step finished"
        );
        self.sink.publish(
            self.profile.message_event,
            &self.conversation_id,
            json!({ "content": answer }),
        );
        if self.profile.emit_done {
            self.sink
                .publish(EventType::Done, &self.conversation_id, json!({}));
        }
        answer
    }

    async fn run_tool_round(&mut self, message: ChatMessage) -> Result<(), AgentError> {
        // Unknown names fail the round before anything runs
        if let Some(call) = message
            .calls()
            .iter()
            .find(|c| ToolKind::from_name(c.name()).is_none())
        {
            warn!(tool = call.name(), "model requested unknown tool");
            return Err(ToolError::UnknownTool(call.name().to_string()).into());
        }

        let calls = message.calls().to_vec();
        if !message.content.is_empty() {
            self.sink.publish(
                EventType::AssistantMessage,
                &self.conversation_id,
                json!({ "content": message.content }),
            );
        }
        self.transcript.push(message);

        for call in &calls {
            let result = self.invoke(call).await?;
            self.transcript.push(ChatMessage::tool(
                call.id.clone(),
                call.name(),
                result.to_string(),
            ));
        }
        Ok(())
    }

    async fn invoke(&mut self, call: &ToolCall) -> Result<Value, AgentError> {
        let Some(tools) = &self.tools else {
            return Ok(error_envelope("no tools available"));
        };

        let invocation_id = Uuid::now_v7().to_string();
        let name = call.name().to_string();
        let arguments = call.function.parsed_arguments();
        let shown_arguments = match &arguments {
            Ok(args) => args.clone(),
            Err(_) => Value::String(call.function.arguments.clone()),
        };

        self.sink.publish(
            EventType::ToolInvocationStart,
            &self.conversation_id,
            json!({
                "invocation_id": invocation_id,
                "tool_call_id": call.id,
                "function": name,
                "arguments": shown_arguments,
            }),
        );

        let result = match arguments {
            Ok(args) => {
                debug!(tool = %name, invocation_id = %invocation_id, "invoking tool");
                tools.execute(&name, &args).await?
            }
            Err(e) => error_envelope(ToolError::InvalidArguments {
                tool: name.clone(),
                reason: format!("arguments are not valid JSON: {e}"),
            }),
        };

        self.tool_calls_made += 1;
        AGENT_TOOL_CALLS
            .with_label_values(&[&name, envelope_status(&result)])
            .inc();

        self.sink.publish(
            EventType::ToolInvocationResult,
            &self.conversation_id,
            json!({
                "invocation_id": invocation_id,
                "function": name,
                "result": result,
            }),
        );
        Ok(result)
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("role", &self.profile.role)
            .field("conversation_id", &self.conversation_id)
            .field("transcript_len", &self.transcript.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::llm::ChatResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns canned responses in order and records what it was sent
    struct Canned {
        replies: Mutex<Vec<ChatResponse>>,
        seen: Mutex<Vec<(Vec<ChatMessage>, usize)>>,
    }

    impl Canned {
        fn new(replies: Vec<ChatMessage>) -> Self {
            let mut replies: Vec<_> = replies.into_iter().map(ChatResponse::new).collect();
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for Canned {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            tools: &[Tool],
        ) -> Result<ChatResponse, ChatError> {
            self.seen
                .lock()
                .unwrap()
                .push((messages.to_vec(), tools.len()));
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or(ChatError::EmptyResponse)
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[tokio::test]
    async fn test_planner_answers_without_tools() {
        let model = Arc::new(Canned::new(vec![ChatMessage::assistant("step one")]));
        let sink = Arc::new(MemorySink::new());
        let mut planner = AgentLoop::new(AgentProfile::planner(), model.clone(), sink.clone(), "c1");

        let answer = planner.step("goal").await.unwrap();
        assert_eq!(answer, "step one");
        assert_eq!(sink.types(), vec![EventType::UserAgentMessage]);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].1, 0);
        assert_eq!(seen[0].0[0], ChatMessage::system(PLANNER_SYSTEM_PROMPT));
    }

    #[tokio::test]
    async fn test_fresh_planner_forgets_previous_step() {
        let model = Arc::new(Canned::new(vec![
            ChatMessage::assistant("a"),
            ChatMessage::assistant("b"),
        ]));
        let mut planner = AgentLoop::new(
            AgentProfile::planner(),
            model.clone(),
            Arc::new(MemorySink::new()),
            "c1",
        );
        planner.step("first").await.unwrap();
        planner.step("second").await.unwrap();

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[1].0.len(), 2);
        assert_eq!(seen[1].0[1], ChatMessage::user("second"));
    }

    #[tokio::test]
    async fn test_assistant_keeps_conversation_and_emits_done() {
        let model = Arc::new(Canned::new(vec![
            ChatMessage::assistant("hello"),
            ChatMessage::assistant("again"),
        ]));
        let sink = Arc::new(MemorySink::new());
        let mut agent = AgentLoop::new(AgentProfile::assistant(), model.clone(), sink.clone(), "c1");
        agent.step("hi").await.unwrap();
        agent.step("more").await.unwrap();

        assert_eq!(agent.transcript().len(), 5);
        assert_eq!(
            sink.types(),
            vec![
                EventType::AssistantMessage,
                EventType::Done,
                EventType::AssistantMessage,
                EventType::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_model_error_leaves_transcript_valid() {
        let model = Arc::new(Canned::new(vec![]));
        let mut agent = AgentLoop::new(
            AgentProfile::assistant(),
            model,
            Arc::new(MemorySink::new()),
            "c1",
        );
        let err = agent.step("hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Model(ChatError::EmptyResponse)));
        assert!(validate_tool_pairing(agent.transcript()).is_ok());
    }

    #[test]
    fn test_profiles() {
        assert_eq!(AgentProfile::executor().reset, ResetPolicy::MinimalToolChain);
        assert!(!AgentProfile::executor().emit_done);
        assert!(!AgentProfile::planner().use_tools);
        assert_eq!(AgentProfile::assistant().with_max_tool_rounds(0).max_tool_rounds, 1);
    }
}
