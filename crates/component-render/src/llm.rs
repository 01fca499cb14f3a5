//! Chat service used by the repair loop
//!
//! The repair loop only needs "prompt in, text or failure out". Failures are
//! reported as an HTTP-like error kind rather than an error value so the
//! repair loop can hand them to its fatal-error policy.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::constants::llm;

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A single-turn request with optional prior history
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    pub history: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

/// Chat result: text on success, otherwise `None` with an error kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: Option<String>,
    /// HTTP-like status; 200 on success
    pub error_kind: u16,
}

impl ChatResponse {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            error_kind: llm::OK,
        }
    }

    pub fn failed(error_kind: u16) -> Self {
        Self {
            content: None,
            error_kind,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_kind == llm::OK
    }
}

/// Opaque chat service
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Send one request. Never fails; failures come back as an error kind.
    async fn chat(&self, request: ChatRequest) -> ChatResponse;
}

/// Token usage totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub max_prompt_tokens: u64,
    pub max_completion_tokens: u64,
    /// Completions that reached the output length limit
    pub outputs_at_limit: u64,
}

impl UsageSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Running token usage of a chat client
#[derive(Debug, Default)]
pub struct UsageStats {
    inner: Mutex<UsageSnapshot>,
}

impl UsageStats {
    pub fn record(&self, prompt_tokens: u64, completion_tokens: u64) {
        let mut stats = self.inner.lock();
        stats.requests += 1;
        stats.prompt_tokens += prompt_tokens;
        stats.completion_tokens += completion_tokens;
        stats.max_prompt_tokens = stats.max_prompt_tokens.max(prompt_tokens);
        stats.max_completion_tokens = stats.max_completion_tokens.max(completion_tokens);
        if completion_tokens >= llm::OUTPUT_TOKEN_LIMIT {
            stats.outputs_at_limit += 1;
        }
        log::debug!(
            "LLM usage: {} requests, {} prompt + {} completion tokens",
            stats.requests,
            stats.prompt_tokens,
            stats.completion_tokens
        );
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.inner.lock().clone()
    }
}

#[derive(Debug, thiserror::Error)]
enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },
}

impl LlmError {
    /// Error kind to report when this error ends the attempt loop early
    fn terminal_kind(&self) -> Option<u16> {
        match self {
            LlmError::Status { body, .. } if is_unbufferable(body) => Some(llm::BAD_REQUEST),
            LlmError::Status { status, .. } if llm::NON_RETRYABLE.contains(status) => Some(*status),
            LlmError::Http(e) if is_unbufferable(&e.to_string()) => Some(llm::BAD_REQUEST),
            _ => None,
        }
    }
}

fn is_unbufferable(message: &str) -> bool {
    message.contains("Failed to buffer the request body")
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints
pub struct OpenAiChatClient {
    http_client: reqwest::Client,
    config: LlmConfig,
    usage: UsageStats,
}

impl OpenAiChatClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            config,
            usage: UsageStats::default(),
        }
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &CompletionRequest<'_>) -> Result<Option<String>, LlmError> {
        let mut builder = self.http_client.post(self.completions_url()).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let completion: CompletionResponse = response.json().await?;
        if let Some(usage) = &completion.usage {
            self.usage.record(usage.prompt_tokens, usage.completion_tokens);
        }

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content))
    }
}

#[async_trait]
impl ChatService for OpenAiChatClient {
    async fn chat(&self, request: ChatRequest) -> ChatResponse {
        let body = CompletionRequest {
            model: &self.config.model,
            messages: request.messages(),
            stream: false,
            max_tokens: request.max_tokens.or(self.config.max_tokens),
            temperature: request.temperature.or(self.config.temperature),
        };
        let delay: Duration = self.config.retry_delay();

        for attempt in 1..=self.config.max_attempts {
            match self.send(&body).await {
                Ok(content) => {
                    return ChatResponse {
                        content,
                        error_kind: llm::OK,
                    }
                }
                Err(e) => {
                    log::warn!("LLM attempt {} failed: {}", attempt, e);
                    if let Some(kind) = e.terminal_kind() {
                        return ChatResponse::failed(kind);
                    }
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        log::error!("LLM request failed after {} attempts", self.config.max_attempts);
        ChatResponse::failed(llm::EXHAUSTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let stats = UsageStats::default();
        stats.record(100, 20);
        stats.record(50, 4095);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.prompt_tokens, 150);
        assert_eq!(snapshot.max_completion_tokens, 4095);
        assert_eq!(snapshot.outputs_at_limit, 1);
        assert_eq!(snapshot.total_tokens(), 4265);
    }

    #[test]
    fn test_terminal_kinds() {
        let status = |status: u16, body: &str| LlmError::Status {
            status,
            body: body.to_string(),
        };
        assert_eq!(status(401, "").terminal_kind(), Some(401));
        assert_eq!(status(422, "").terminal_kind(), Some(422));
        assert_eq!(status(500, "").terminal_kind(), None);
        assert_eq!(status(429, "").terminal_kind(), None);
        assert_eq!(
            status(413, "Failed to buffer the request body: length limit exceeded").terminal_kind(),
            Some(400)
        );
    }

    #[test]
    fn test_request_messages_end_with_prompt() {
        let mut request = ChatRequest::new("fix it");
        request.history.push(ChatMessage {
            role: "system".to_string(),
            content: "You are a React expert".to_string(),
        });
        let messages = request.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], ChatMessage::user("fix it"));
    }
}
