//! OpenAI Chat Completions backend.

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

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    api_key: SecretString,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                if m.images.is_empty() {
                    return json!({"role": role, "content": m.content});
                }
                let mut content = vec![json!({"type": "text", "text": m.content})];
                content.extend(m.images.iter().map(|image| {
                    json!({"type": "image_url", "image_url": {"url": image_url(image)}})
                }));
                json!({"role": role, "content": content})
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "response_format": {"type": "json_object"},
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

fn image_url(image: &ImageInput) -> String {
    match image {
        ImageInput::Url(url) => url.clone(),
        ImageInput::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
    }
}

fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
    let choice = &body["choices"][0];
    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "missing choices[0].message.content".into(),
        })?;

    Ok(CompletionResponse {
        content: content.to_string(),
        input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        finish_reason: FinishReason::from_provider(choice["finish_reason"].as_str()),
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
        debug!(model = %self.model, "Sending OpenAI completion");

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
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
