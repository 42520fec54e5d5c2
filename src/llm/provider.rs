//! LLM provider trait and the request/response types shared by every tier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Token limit for single-prompt providers, which get a shorter budget.
    pub compact_max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.2,
            max_tokens: 1024,
            compact_max_tokens: 800,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_compact_max_tokens(mut self, max_tokens: u32) -> Self {
        self.compact_max_tokens = max_tokens;
        self
    }

    /// Non-system messages flattened into one prompt.
    pub fn user_prompt(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Completion output plus what the audit trail needs.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Model text, expected to contain one JSON object.
    pub content: String,
    /// Request payload as sent, with PII redacted.
    pub request_redacted: String,
    /// Response body as received.
    pub response_text: String,
    /// Parsed response body, re-serialised.
    pub response_json: Option<String>,
}

/// An LLM backend the classification chain can call.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Attribution name recorded with results.
    fn name(&self) -> &str;

    /// Model identifier recorded with results.
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest)
    -> Result<CompletionResponse, LlmError>;
}

/// Pull the assistant text out of an OpenAI-style chat completion body.
///
/// Content may be a plain string or an array of `{text}` parts, which are
/// joined with newlines. A body without content yields `"{}"`.
pub fn chat_content(body: &Value) -> String {
    match body.pointer("/choices/0/message/content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|p| p.get("text").and_then(Value::as_str).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => "{}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_as_string() {
        let body = json!({"choices": [{"message": {"content": "{\"a\":1}"}}]});
        assert_eq!(chat_content(&body), "{\"a\":1}");
    }

    #[test]
    fn content_as_parts() {
        let body = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "{\"a\":"},
            {"type": "text", "text": "1}"}
        ]}}]});
        assert_eq!(chat_content(&body), "{\"a\":\n1}");
    }

    #[test]
    fn missing_content_is_empty_object() {
        assert_eq!(chat_content(&json!({"choices": []})), "{}");
    }

    #[test]
    fn user_prompt_skips_system_messages() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("rules"),
            ChatMessage::user("classify this"),
        ]);
        assert_eq!(request.user_prompt(), "classify this");
    }

    #[test]
    fn roles_serialize_lowercase() {
        let value = serde_json::to_value(ChatMessage::system("x")).unwrap();
        assert_eq!(value["role"], "system");
    }
}
