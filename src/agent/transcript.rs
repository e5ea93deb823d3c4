//! Transcript invariants and reconstruction
//!
//! A transcript is valid for submission when every assistant message with N
//! tool calls is followed, before anything else, by exactly N tool messages
//! whose `tool_call_id`s match the calls one-to-one.

use std::collections::HashSet;

use thiserror::Error;

use crate::llm::{ChatMessage, Role};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("assistant message {index} has unanswered tool calls: {missing:?}")]
    UnansweredToolCalls { index: usize, missing: Vec<String> },
    #[error("tool message {index} answers no pending call ({call_id:?})")]
    UnexpectedToolMessage {
        index: usize,
        call_id: Option<String>,
    },
    #[error("tool message {index} answers call {call_id} twice")]
    DuplicateToolResponse { index: usize, call_id: String },
}

/// Check the tool-call pairing invariant
pub fn validate_tool_pairing(messages: &[ChatMessage]) -> Result<(), TranscriptError> {
    let mut i = 0;
    while i < messages.len() {
        let message = &messages[i];
        match message.role {
            Role::Assistant if message.has_tool_calls() => {
                let mut pending: Vec<&str> =
                    message.calls().iter().map(|c| c.id.as_str()).collect();
                let mut answered: HashSet<&str> = HashSet::new();
                let mut j = i + 1;
                while j < messages.len() && messages[j].role == Role::Tool {
                    let call_id = messages[j].tool_call_id.as_deref();
                    match call_id {
                        Some(id) if answered.contains(id) => {
                            return Err(TranscriptError::DuplicateToolResponse {
                                index: j,
                                call_id: id.to_string(),
                            });
                        }
                        Some(id) if pending.contains(&id) => {
                            pending.retain(|p| *p != id);
                            answered.insert(id);
                        }
                        _ => {
                            return Err(TranscriptError::UnexpectedToolMessage {
                                index: j,
                                call_id: call_id.map(str::to_string),
                            });
                        }
                    }
                    j += 1;
                }
                if !pending.is_empty() {
                    return Err(TranscriptError::UnansweredToolCalls {
                        index: i,
                        missing: pending.into_iter().map(str::to_string).collect(),
                    });
                }
                i = j;
            }
            Role::Tool => {
                return Err(TranscriptError::UnexpectedToolMessage {
                    index: i,
                    call_id: message.tool_call_id.clone(),
                });
            }
            _ => i += 1,
        }
    }
    Ok(())
}

/// Keep only the previous round's tool-call chain
///
/// The round is everything after the last `user` message. From it, each
/// assistant message with tool calls is kept (restricted to the calls that
/// were answered) together with its tool responses, ordered like the calls.
/// Assistant turns without answered calls, final answers, system and user
/// messages are dropped. The result always satisfies
/// [`validate_tool_pairing`].
pub fn rebuild_minimal_tool_chain(previous: &[ChatMessage]) -> Vec<ChatMessage> {
    let round_start = previous
        .iter()
        .rposition(|m| m.role == Role::User)
        .map(|i| i + 1)
        .unwrap_or(0);
    let round = &previous[round_start..];

    let mut chain = Vec::new();
    let mut i = 0;
    while i < round.len() {
        let message = &round[i];
        if message.role != Role::Assistant || !message.has_tool_calls() {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < round.len() && round[j].role == Role::Tool {
            j += 1;
        }
        let responses = &round[i + 1..j];

        let mut calls = Vec::new();
        let mut matched = Vec::new();
        for call in message.calls() {
            let response = responses
                .iter()
                .find(|r| r.tool_call_id.as_deref() == Some(call.id.as_str()));
            if let Some(response) = response {
                calls.push(call.clone());
                matched.push(response.clone());
            }
        }

        if !calls.is_empty() {
            chain.push(ChatMessage::assistant_with_tools(message.content.clone(), calls));
            chain.extend(matched);
        }
        i = j;
    }
    chain
}

/// How an agent's transcript is prepared at the start of each step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Continue the existing conversation
    Keep,
    /// Start from the system prompt every time
    Fresh,
    /// System prompt plus the previous round's tool-call chain
    MinimalToolChain,
}

impl ResetPolicy {
    pub fn apply(self, system_prompt: &str, transcript: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut fresh = Vec::new();
        if !system_prompt.is_empty() {
            fresh.push(ChatMessage::system(system_prompt));
        }
        match self {
            ResetPolicy::Keep if !transcript.is_empty() => transcript.to_vec(),
            ResetPolicy::Keep | ResetPolicy::Fresh => fresh,
            ResetPolicy::MinimalToolChain => {
                fresh.extend(rebuild_minimal_tool_chain(transcript));
                fresh
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "exec_code", &json!({"code": "1"}))
    }

    fn tool(id: &str) -> ChatMessage {
        ChatMessage::tool(id, "exec_code", "{}")
    }

    #[test]
    fn test_valid_transcript() {
        let messages = vec![
            ChatMessage::system("s"),
            ChatMessage::user("u"),
            ChatMessage::assistant_with_tools("", vec![call("a"), call("b")]),
            tool("b"),
            tool("a"),
            ChatMessage::assistant("done"),
        ];
        assert_eq!(validate_tool_pairing(&messages), Ok(()));
    }

    #[test]
    fn test_missing_response() {
        let messages = vec![
            ChatMessage::assistant_with_tools("", vec![call("a"), call("b")]),
            tool("a"),
            ChatMessage::assistant("done"),
        ];
        assert_eq!(
            validate_tool_pairing(&messages),
            Err(TranscriptError::UnansweredToolCalls {
                index: 0,
                missing: vec!["b".to_string()]
            })
        );
    }

    #[test]
    fn test_orphan_and_duplicate_responses() {
        let orphan = vec![ChatMessage::user("u"), tool("x")];
        assert!(matches!(
            validate_tool_pairing(&orphan),
            Err(TranscriptError::UnexpectedToolMessage { index: 1, .. })
        ));

        let duplicate = vec![
            ChatMessage::assistant_with_tools("", vec![call("a")]),
            tool("a"),
            tool("a"),
        ];
        assert!(matches!(
            validate_tool_pairing(&duplicate),
            Err(TranscriptError::DuplicateToolResponse { index: 2, .. })
        ));

        let stray = vec![
            ChatMessage::assistant_with_tools("", vec![call("a")]),
            tool("a"),
            tool("z"),
        ];
        assert!(matches!(
            validate_tool_pairing(&stray),
            Err(TranscriptError::UnexpectedToolMessage { index: 2, .. })
        ));
    }

    #[test]
    fn test_rebuild_keeps_last_round_chain() {
        let previous = vec![
            ChatMessage::system("s"),
            ChatMessage::user("plan 1"),
            ChatMessage::assistant_with_tools("old", vec![call("old")]),
            tool("old"),
            ChatMessage::assistant("answer 1"),
            ChatMessage::user("plan 2"),
            ChatMessage::assistant_with_tools("look", vec![call("a"), call("b")]),
            tool("b"),
            tool("a"),
            ChatMessage::assistant_with_tools("run", vec![call("c")]),
            tool("c"),
            ChatMessage::assistant("answer 2"),
        ];
        let chain = rebuild_minimal_tool_chain(&previous);

        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0].content, "look");
        let ids: Vec<_> = chain[0].calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        // Responses follow call order
        assert_eq!(chain[1].tool_call_id.as_deref(), Some("a"));
        assert_eq!(chain[2].tool_call_id.as_deref(), Some("b"));
        assert_eq!(chain[3].content, "run");
        assert_eq!(chain[4].tool_call_id.as_deref(), Some("c"));
        assert!(chain.iter().all(|m| m.role != Role::User && m.role != Role::System));
        assert_eq!(validate_tool_pairing(&chain), Ok(()));
    }

    #[test]
    fn test_rebuild_drops_unanswered_calls() {
        let previous = vec![
            ChatMessage::user("plan"),
            ChatMessage::assistant_with_tools("", vec![call("a"), call("b")]),
            tool("a"),
            ChatMessage::assistant_with_tools("", vec![call("c")]),
        ];
        let chain = rebuild_minimal_tool_chain(&previous);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].calls().len(), 1);
        assert_eq!(chain[0].calls()[0].id, "a");
        assert_eq!(validate_tool_pairing(&chain), Ok(()));
    }

    #[test]
    fn test_rebuild_of_empty_or_toolless_round() {
        assert!(rebuild_minimal_tool_chain(&[]).is_empty());
        let previous = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        assert!(rebuild_minimal_tool_chain(&previous).is_empty());
    }

    #[test]
    fn test_reset_policies() {
        let transcript = vec![
            ChatMessage::system("old system"),
            ChatMessage::user("u"),
            ChatMessage::assistant_with_tools("", vec![call("a")]),
            tool("a"),
            ChatMessage::assistant("done"),
        ];

        let kept = ResetPolicy::Keep.apply("sys", &transcript);
        assert_eq!(kept, transcript);
        assert_eq!(ResetPolicy::Keep.apply("sys", &[]).len(), 1);

        let fresh = ResetPolicy::Fresh.apply("sys", &transcript);
        assert_eq!(fresh, vec![ChatMessage::system("sys")]);

        let minimal = ResetPolicy::MinimalToolChain.apply("sys", &transcript);
        assert_eq!(minimal.len(), 3);
        assert_eq!(minimal[0], ChatMessage::system("sys"));
        assert_eq!(minimal[2].role, Role::Tool);

        assert!(ResetPolicy::Fresh.apply("", &transcript).is_empty());
    }
}
