//! Retry wrapper for transient provider failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Upper bound on any single wait, including a provider's `Retry-After`.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Retries rate limits, timeouts and 5xx responses with exponential backoff and jitter.
pub struct RetryProvider {
    inner: Arc<dyn LlmProvider>,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited {
            retry_after: Some(after),
            ..
        } = err
        {
            return (*after).min(MAX_RETRY_DELAY);
        }
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(6));
        let jitter_ms = self.base_delay.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (exp + Duration::from_millis(jitter)).min(MAX_RETRY_DELAY)
    }
}

#[async_trait]
impl LlmProvider for RetryProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.inner.cost_per_token()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt, &e);
                    warn!(
                        provider = self.inner.provider_name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient LLM failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
