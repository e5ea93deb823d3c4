//! Planner + executor ReAct cycle
//!
//! ```text
//! plan₀ = planner(goal)                     (Planning)
//! for round in 1..=5:
//!     answer = executor.step(plan)          (Acting / Observing)
//!     if round < 5:
//!         plan = planner(goal, history)     (Replanning) ── marker? → done
//! fallback answer                           → done
//! ```

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use super::prompts::{contains_completion_marker, max_rounds_fallback, render_planner_prompt};
use super::runner::{AgentError, AgentLoop};
use crate::events::{EventSink, EventType};
use crate::llm::ChatMessage;
use crate::metrics::REACT_ROUNDS;

pub const MAX_REACT_ROUNDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactPhase {
    Planning,
    Acting,
    Observing,
    Replanning,
    Finished,
}

#[derive(Debug, Clone)]
pub struct DualAgentState {
    pub goal: String,
    pub plan: String,
    pub phase: ReactPhase,
    /// Executor rounds run so far
    pub iteration: usize,
    pub completed: bool,
    pub last_transcript: Vec<ChatMessage>,
    pub last_response: String,
}

impl DualAgentState {
    fn new(goal: &str) -> Self {
        Self {
            goal: goal.to_string(),
            plan: String::new(),
            phase: ReactPhase::Planning,
            iteration: 0,
            completed: false,
            last_transcript: Vec::new(),
            last_response: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DualOutcome {
    pub final_response: String,
    pub iterations: usize,
    /// A planner marker ended the run (as opposed to the round cap)
    pub completed: bool,
    pub planner_invocations: usize,
    pub tool_calls_made: usize,
}

pub struct DualAgentController {
    planner: AgentLoop,
    executor: AgentLoop,
    sink: Arc<dyn EventSink>,
    conversation_id: String,
    max_rounds: usize,
    state: Option<DualAgentState>,
}

impl DualAgentController {
    pub fn new(
        planner: AgentLoop,
        executor: AgentLoop,
        sink: Arc<dyn EventSink>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            planner,
            executor,
            sink,
            conversation_id: conversation_id.into(),
            max_rounds: MAX_REACT_ROUNDS,
            state: None,
        }
    }

    /// State of the most recent run
    pub fn state(&self) -> Option<&DualAgentState> {
        self.state.as_ref()
    }

    pub async fn run(&mut self, goal: &str) -> Result<DualOutcome, AgentError> {
        let mut state = DualAgentState::new(goal);
        let mut planner_invocations = 0;

        let result = self.cycle(&mut state, &mut planner_invocations).await;
        state.phase = ReactPhase::Finished;
        state.last_transcript = self.executor.transcript().to_vec();
        REACT_ROUNDS.observe(state.iteration as f64);

        let final_response = match result {
            Ok(answer) => answer,
            Err(e) => {
                self.state = Some(state);
                self.sink.publish(
                    EventType::Done,
                    &self.conversation_id,
                    json!({ "error": e.to_string() }),
                );
                return Err(e);
            }
        };

        info!(
            conversation_id = %self.conversation_id,
            iterations = state.iteration,
            completed = state.completed,
            planner_invocations,
            "dual-agent run finished"
        );
        self.sink.publish(
            EventType::Done,
            &self.conversation_id,
            json!({ "iterations": state.iteration, "completed": state.completed }),
        );

        let outcome = DualOutcome {
            final_response,
            iterations: state.iteration,
            completed: state.completed,
            planner_invocations,
            tool_calls_made: self.executor.tool_calls_made(),
        };
        self.state = Some(state);
        Ok(outcome)
    }

    async fn cycle(
        &mut self,
        state: &mut DualAgentState,
        planner_invocations: &mut usize,
    ) -> Result<String, AgentError> {
        *planner_invocations += 1;
        state.plan = self
            .planner
            .step(&render_planner_prompt(&state.goal, &[]))
            .await?;

        // Markers only count once the executor has acted at least once
        for round in 1..=self.max_rounds {
            state.iteration = round;
            state.phase = ReactPhase::Acting;
            debug!(conversation_id = %self.conversation_id, round, "executor round");
            state.last_response = self.executor.step(&state.plan).await?;
            state.phase = ReactPhase::Observing;

            if round == self.max_rounds {
                break;
            }

            state.phase = ReactPhase::Replanning;
            *planner_invocations += 1;
            let prompt = render_planner_prompt(&state.goal, self.executor.transcript());
            state.plan = self.planner.step(&prompt).await?;
            if contains_completion_marker(&state.plan) {
                state.completed = true;
                return Ok(state.plan.clone());
            }
        }

        info!(
            conversation_id = %self.conversation_id,
            rounds = self.max_rounds,
            "react round limit reached without a completion marker"
        );
        Ok(max_rounds_fallback(self.max_rounds, &state.last_response))
    }
}
