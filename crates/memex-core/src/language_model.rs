//! Language model abstraction used by the derivative mutation pipeline to
//! rewrite derivatives in third person.
//!
//! Grounded on `common/language_model/language_model.py` (abstract base) and
//! `common/language_model/openai_compatible_language_model.py` (concrete
//! OpenAI-compatible chat-completions implementation), following the same
//! retry/backoff shape already established in `reranker/model_hosted.rs`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::embedder::{retry_with_backoff, RetryableError};

/// Error surface for [`LanguageModel`] implementations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LanguageModelError {
    #[error("language model request failed: {0}")]
    RequestFailed(String),

    #[error("language model rate limited")]
    RateLimited,

    #[error("language model request timed out")]
    Timeout,

    #[error("invalid tool-call response: {0}")]
    InvalidToolCall(String),

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, #[source] source: Box<LanguageModelError> },
}

impl RetryableError for LanguageModelError {
    fn is_retryable(&self) -> bool {
        matches!(self, LanguageModelError::RateLimited | LanguageModelError::Timeout)
    }
}

/// A tool a language model may choose to invoke as part of its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool invocation decided by the model, surfaced back to the caller
/// alongside (or instead of) a text response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// How the model should choose whether/which tool to call, matching the
/// original's `tool_choice` passthrough (`"auto"`, `"none"`, or a forced
/// tool name).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Forced(String),
}

/// Generates a response given a system/user prompt pair, optionally with
/// tools the model may call. Mirrors the original's `LanguageModel`
/// abstract base.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns the generated text plus any tool calls the model made.
    async fn generate_response(
        &self,
        system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        tools: Option<Vec<ToolDefinition>>,
        tool_choice: ToolChoice,
        max_attempts: u32,
    ) -> Result<(String, Vec<ToolCall>), LanguageModelError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolDefinition,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Deserialize)]
struct RawToolCall {
    id: String,
    function: RawToolCallFunction,
}

#[derive(Deserialize)]
struct RawToolCallFunction {
    name: String,
    arguments: String,
}

/// OpenAI-compatible chat-completions client, usable against any endpoint
/// implementing the same wire shape (OpenAI, vLLM, many local servers).
/// Mirrors `OpenAICompatibleLanguageModel`.
pub struct OpenAiCompatibleLanguageModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    base_delay: Duration,
    max_delay: Duration,
}

impl OpenAiCompatibleLanguageModel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    async fn request_once(
        &self,
        system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        tools: Option<&[ToolDefinition]>,
        tool_choice: &ToolChoice,
    ) -> Result<(String, Vec<ToolCall>), LanguageModelError> {
        let mut messages = Vec::new();
        if let Some(system_prompt) = system_prompt {
            messages.push(ChatMessage { role: "system", content: system_prompt });
        }
        if let Some(user_prompt) = user_prompt {
            messages.push(ChatMessage { role: "user", content: user_prompt });
        }

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: tools.map(|tools| {
                tools
                    .iter()
                    .map(|tool| OpenAiTool { kind: "function", function: tool.clone() })
                    .collect()
            }),
            tool_choice: match tool_choice {
                ToolChoice::Auto => None,
                ToolChoice::None => Some(Value::String("none".to_string())),
                ToolChoice::Forced(name) => Some(serde_json::json!({
                    "type": "function",
                    "function": {"name": name},
                })),
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LanguageModelError::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LanguageModelError::RequestFailed(format!("{status}: {body}")));
        }

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(map_reqwest_error)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LanguageModelError::RequestFailed("no choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|raw| {
                let arguments: Value = serde_json::from_str(&raw.function.arguments)
                    .map_err(|e| LanguageModelError::InvalidToolCall(e.to_string()))?;
                Ok(ToolCall { call_id: raw.id, name: raw.function.name, arguments })
            })
            .collect::<Result<Vec<_>, LanguageModelError>>()?;

        Ok((choice.message.content.unwrap_or_default(), tool_calls))
    }
}

fn map_reqwest_error(error: reqwest::Error) -> LanguageModelError {
    if error.is_timeout() {
        LanguageModelError::Timeout
    } else {
        LanguageModelError::RequestFailed(error.to_string())
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleLanguageModel {
    async fn generate_response(
        &self,
        system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        tools: Option<Vec<ToolDefinition>>,
        tool_choice: ToolChoice,
        max_attempts: u32,
    ) -> Result<(String, Vec<ToolCall>), LanguageModelError> {
        retry_with_backoff(max_attempts, self.base_delay, self.max_delay, || {
            let tools = tools.clone();
            let tool_choice = tool_choice_clone(&tool_choice);
            async move { self.request_once(system_prompt, user_prompt, tools.as_deref(), &tool_choice).await }
        })
        .await
    }
}

fn tool_choice_clone(tool_choice: &ToolChoice) -> ToolChoice {
    match tool_choice {
        ToolChoice::Auto => ToolChoice::Auto,
        ToolChoice::None => ToolChoice::None,
        ToolChoice::Forced(name) => ToolChoice::Forced(name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_and_timeout_are_retryable() {
        assert!(LanguageModelError::RateLimited.is_retryable());
        assert!(LanguageModelError::Timeout.is_retryable());
        assert!(!LanguageModelError::RequestFailed("x".into()).is_retryable());
    }
}
