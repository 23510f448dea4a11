use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use chartflow_core::config::RetryConfig;
use chartflow_core::error::{ChartflowError, Result};
use chartflow_core::traits::Generator;
use chartflow_core::types::{StructuredRequest, TextRequest};

/// A generator that retries transient failures with exponential backoff.
pub struct RetryingGenerator {
    inner: Box<dyn Generator>,
    retry_config: RetryConfig,
}

impl RetryingGenerator {
    pub fn new(inner: Box<dyn Generator>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.retry_config.max_retries;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry_config);
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying generation request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(e: &ChartflowError) -> bool {
    match e {
        ChartflowError::GenerationRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Generator for RetryingGenerator {
    fn generate_text(&self, request: TextRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.with_retries(|| self.inner.generate_text(request.clone()))
                .await
        })
    }

    fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.with_retries(|| self.inner.generate_structured(request.clone()))
                .await
        })
    }
}
