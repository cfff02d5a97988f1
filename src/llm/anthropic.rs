//! Anthropic Messages API backend.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::costs::model_cost;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, ImageInput, LlmProvider, Role,
    error_from_response, error_from_transport,
};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    api_key: SecretString,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        })
    }

    /// Point the provider at a different host (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let mut content: Vec<Value> = m.images.iter().map(image_block).collect();
                content.push(json!({"type": "text", "text": m.content}));
                json!({
                    "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                    "content": content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if let Some(system) = request.system_prompt() {
            body["system"] = Value::String(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

fn image_block(image: &ImageInput) -> Value {
    match image {
        ImageInput::Url(url) => json!({
            "type": "image",
            "source": {"type": "url", "url": url},
        }),
        ImageInput::Base64 { media_type, data } => json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }),
    }
}

/// Pull text, usage and stop reason out of a Messages API response.
fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "missing content array".into(),
        })?;
    let content: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    Ok(CompletionResponse {
        content,
        input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        finish_reason: FinishReason::from_provider(body["stop_reason"].as_str()),
    })
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        model_cost(&self.model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(&request);
        debug!(model = %self.model, "Sending Anthropic completion");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| error_from_transport(PROVIDER, e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(PROVIDER, resp).await);
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;
        parse_response(&json)
    }
}
