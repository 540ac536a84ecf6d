use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::warn;

use threadloom_core::config::RetryConfig;
use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::ChatBackend;
use threadloom_core::types::ChatRequest;

/// A backend that retries failures to open a stream. Once a stream is
/// open, its errors pass through untouched.
pub struct RetryingBackend {
    inner: Box<dyn ChatBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Box<dyn ChatBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

fn is_retryable(e: &ThreadloomError) -> bool {
    match e {
        ThreadloomError::ProviderError(msg) => {
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

fn backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ChatBackend for RetryingBackend {
    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            let max_retries = self.config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.chat_stream(request.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let delay = backoff(attempt, &self.config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying provider request"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use threadloom_test_utils::MockBackend;

    /// Fails to open `failures` times with `message`, then delegates.
    struct Flaky {
        failures: u32,
        message: &'static str,
        calls: Arc<AtomicU32>,
        inner: MockBackend,
    }

    impl ChatBackend for Flaky {
        fn chat_stream(
            &self,
            request: ChatRequest,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                let message = self.message.to_string();
                return Box::pin(async move { Err(ThreadloomError::ProviderError(message)) });
            }
            self.inner.chat_stream(request)
        }
    }

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            messages: vec![],
        }
    }

    #[tokio::test]
    async fn test_retries_transient_open_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = RetryingBackend::new(
            Box::new(Flaky {
                failures: 2,
                message: "HTTP 503 Service Unavailable: busy",
                calls: calls.clone(),
                inner: MockBackend::new(&["ok"]),
            }),
            config(),
        );
        let chunks: Vec<_> = backend.chat_stream(request()).await.unwrap().collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = RetryingBackend::new(
            Box::new(Flaky {
                failures: 10,
                message: "HTTP 429 Too Many Requests: slow down",
                calls: calls.clone(),
                inner: MockBackend::new(&[]),
            }),
            config(),
        );
        assert!(backend.chat_stream(request()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = RetryingBackend::new(
            Box::new(Flaky {
                failures: 1,
                message: "HTTP 401 Unauthorized: bad key",
                calls: calls.clone(),
                inner: MockBackend::new(&[]),
            }),
            config(),
        );
        assert!(backend.chat_stream(request()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
        };
        assert!(backoff(8, &config) <= Duration::from_millis(4800));
        assert!(backoff(0, &config) >= Duration::from_millis(800));
    }
}
