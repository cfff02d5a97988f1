//! Vision LLM integration.
//!
//! Supports:
//! - **Anthropic**: Messages API with image content blocks
//! - **OpenAI**: Chat Completions with `image_url` parts
//!
//! Both backends speak plain HTTP through `reqwest` and are wrapped in a
//! `RetryProvider` for transient failures.

pub mod anthropic;
mod costs;
pub mod openai;
pub mod provider;
pub(crate) mod retry;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use provider::*;
pub use retry::RetryProvider;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl std::str::FromStr for LlmBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            _ => Err(format!("Unknown LLM backend: {}", s)),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Override the provider host.
    pub base_url: Option<String>,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let inner: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            let mut provider = AnthropicProvider::new(
                config.api_key.clone(),
                &config.model,
                config.request_timeout,
            )?;
            if let Some(ref url) = config.base_url {
                provider = provider.with_base_url(url);
            }
            tracing::info!("Using Anthropic (model: {})", config.model);
            Arc::new(provider)
        }
        LlmBackend::OpenAi => {
            let mut provider =
                OpenAiProvider::new(config.api_key.clone(), &config.model, config.request_timeout)?;
            if let Some(ref url) = config.base_url {
                provider = provider.with_base_url(url);
            }
            tracing::info!("Using OpenAI (model: {})", config.model);
            Arc::new(provider)
        }
    };

    Ok(Arc::new(RetryProvider::new(
        inner,
        config.max_attempts,
        config.retry_base_delay,
    )))
}
