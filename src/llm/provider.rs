//! Provider trait and request/response types shared by all vision backends.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// An image attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Publicly reachable URL the provider fetches itself.
    Url(String),
    /// Inline image bytes, base64-encoded.
    Base64 { media_type: String, data: String },
}

/// A single chat message, optionally carrying images.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub images: Vec<ImageInput>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Concatenated system prompt (providers that take it out-of-band).
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

impl FinishReason {
    pub fn from_provider(raw: Option<&str>) -> Self {
        match raw {
            Some("end_turn" | "stop" | "stop_sequence") => Self::Stop,
            Some("max_tokens" | "length") => Self::Length,
            Some("content_filter" | "refusal") => Self::ContentFilter,
            _ => Self::Unknown,
        }
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

/// A vision-capable LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier sent to the provider.
    fn model_name(&self) -> &str;

    /// Provider name for logs and the cost ledger.
    fn provider_name(&self) -> &str {
        "unknown"
    }

    /// (input, output) cost per token in USD.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    /// Run a completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Estimated USD cost of a response.
pub fn estimate_cost(provider: &dyn LlmProvider, response: &CompletionResponse) -> Decimal {
    let (input, output) = provider.cost_per_token();
    input * Decimal::from(response.input_tokens) + output * Decimal::from(response.output_tokens)
}

/// Map a non-success HTTP response into an `LlmError`.
pub(crate) async fn error_from_response(provider: &str, resp: reqwest::Response) -> LlmError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();

    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        code => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {code}: {}", truncate(&body, 300)),
        },
    }
}

/// Map a transport-level reqwest error.
pub(crate) fn error_from_transport(provider: &str, err: reqwest::Error) -> LlmError {
    let reason = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    LlmError::RequestFailed {
        provider: provider.to_string(),
        reason,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}
