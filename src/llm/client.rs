//! OpenAI-compatible chat completions client

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use super::tool_use::{ChatMessage, ChatResponse, CompletionBody, CompletionChoice, Tool};
use crate::config::ModelConfig;
use crate::metrics::LLM_CALL_TIME;

/// Error type for chat operations
#[derive(Debug, Error)]
pub enum ChatError {
    /// Non-success HTTP status from the model endpoint
    #[error("model API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to decode model response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("model response contained no choices")]
    EmptyResponse,
    #[error("model {0} cannot describe images")]
    VisionUnsupported(String),
}

/// Anything that can answer a transcript with a message
///
/// The agent loops depend on this trait only, so tests can swap in a
/// scripted model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Tool])
        -> Result<ChatResponse, ChatError>;

    fn model_name(&self) -> &str;

    /// Describe an image given as a `data:` URL
    async fn describe_image(&self, image_url: &str, prompt: &str) -> Result<String, ChatError> {
        let _ = (image_url, prompt);
        Err(ChatError::VisionUnsupported(self.model_name().to_string()))
    }
}

/// Client for `POST {endpoint}/chat/completions`
#[derive(Clone)]
pub struct ChatClient {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            client: reqwest::Client::new(),
        }
    }

    /// Check that the endpoint answers `GET /models`
    pub async fn test_connection(&self) -> Result<(), ChatError> {
        let response = self
            .client
            .get(format!("{}/models", self.endpoint))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// POST a completion request and return the first choice
    async fn complete(&self, body: Value) -> Result<CompletionChoice, ChatError> {
        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        LLM_CALL_TIME
            .with_label_values(&[&self.model])
            .observe(started.elapsed().as_secs_f64());

        if !status.is_success() {
            return Err(ChatError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let completion: CompletionBody = serde_json::from_str(&text)?;
        completion
            .choices
            .into_iter()
            .next()
            .ok_or(ChatError::EmptyResponse)
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChatResponse, ChatError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let choice = self.complete(body).await?;
        debug!(
            model = %self.model,
            tool_calls = choice.message.calls().len(),
            finish_reason = ?choice.finish_reason,
            "chat completion received"
        );

        Ok(ChatResponse {
            message: choice.message,
            finish_reason: choice.finish_reason,
        })
    }

    async fn describe_image(&self, image_url: &str, prompt: &str) -> Result<String, ChatError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": "You are an image analysis assistant." },
                {
                    "role": "user",
                    "content": [
                        { "type": "image_url", "image_url": { "url": image_url } },
                        { "type": "text", "text": prompt },
                    ],
                },
            ],
        });
        let choice = self.complete(body).await?;
        debug!(model = %self.model, "image description received");
        Ok(choice.message.content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
