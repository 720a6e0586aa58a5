//! Gateway for OpenAI-compatible chat completions.

pub mod completions;
pub mod error;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::sleep;

use completions::{ChatProvider, CompletionsAdapter};
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

/// In-flight requests used by the provided `chat_batch`.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 8;

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Send many requests; result `i` always belongs to request `i`.
    async fn chat_batch(
        &self,
        reqs: Vec<ChatRequest>,
    ) -> Vec<Result<ChatResponse, ProviderError>> {
        stream::iter(reqs)
            .map(|req| self.chat(req))
            .buffered(DEFAULT_BATCH_CONCURRENCY)
            .collect()
            .await
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub batch_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl GatewayConfig {
    /// One HTTP call per `chat`; failures go straight back to the caller.
    ///
    /// Screening counts every call against `num_of_max_requests`, so its gateway
    /// must not retry underneath it.
    pub fn single_attempt(batch_concurrency: usize) -> Self {
        Self {
            max_retries: 0,
            batch_concurrency,
            ..Self::default()
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    adapter: CompletionsAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }

    async fn chat_batch(
        &self,
        reqs: Vec<ChatRequest>,
    ) -> Vec<Result<ChatResponse, ProviderError>> {
        let concurrency = self.config.batch_concurrency.max(1);
        stream::iter(reqs)
            .map(|req| ProviderGateway::chat(self, req))
            .buffered(concurrency)
            .collect()
            .await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(
        fallback_base_url: Option<&str>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let adapter = CompletionsAdapter::from_env(fallback_base_url)?;
        Ok(Self::with_config(adapter, usage_sink, config))
    }

    pub fn with_config(
        adapter: CompletionsAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapter,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.adapter.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(&req, &ChatResponse::empty(), CallStatus::Error, Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    tracing::debug!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying completions call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("completions", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .run(req.attribution.run_id)
        .latency(resp.latency.as_millis() as u64);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }

    #[test]
    fn single_attempt_never_retries() {
        let config = GatewayConfig::single_attempt(3);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.batch_concurrency, 3);
    }
}
