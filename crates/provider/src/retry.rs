use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use types::{Context, Provider, ProviderError, ProviderId, ProviderStream, ReliabilityConfig};

const MIN_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total setup attempts, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ReliabilityConfig::default())
    }
}

impl From<&ReliabilityConfig> for RetryPolicy {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// At least one attempt, a non-zero base and a cap no lower than the base.
    fn clamped(self) -> Self {
        let backoff_base = self.backoff_base.max(MIN_BACKOFF);
        Self {
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): the base doubled per
    /// earlier failure, capped at `backoff_max`.
    pub(crate) fn backoff_delay_for_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1_u32 << doublings)
            .min(self.backoff_max)
    }
}

/// Retries stream *setup* (connect, HTTP status) with exponential backoff.
///
/// Once a stream has been handed out it is never replayed: deltas may
/// already have reached the renderer, so a mid-stream failure is surfaced
/// to the caller as-is.
pub struct ReliableProvider {
    inner: Arc<dyn Provider>,
    retry_policy: RetryPolicy,
}

impl ReliableProvider {
    pub fn new(inner: Box<dyn Provider>, retry_policy: RetryPolicy) -> Self {
        Self::from_arc(Arc::from(inner), retry_policy)
    }

    pub fn from_arc(inner: Arc<dyn Provider>, retry_policy: RetryPolicy) -> Self {
        Self {
            inner,
            retry_policy: retry_policy.clamped(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }
}

#[async_trait]
impl Provider for ReliableProvider {
    fn provider_id(&self) -> &ProviderId {
        self.inner.provider_id()
    }

    async fn stream(
        &self,
        context: &Context,
        buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError> {
        let max_attempts = self.retry_policy.max_attempts;
        let mut attempt = 1_u32;
        loop {
            let error = match self.inner.stream(context, buffer_size).await {
                Ok(stream) => return Ok(stream),
                Err(error) => error,
            };
            if attempt >= max_attempts || !is_transient(&error) {
                tracing::debug!(attempt, max_attempts, %error, "giving up on stream setup");
                return Err(error);
            }

            let delay = self.retry_policy.backoff_delay_for_attempt(attempt);
            tracing::warn!(
                provider = %self.inner.provider_id(),
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "stream setup failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Connection failures, rate limiting and server errors are worth another
/// attempt; client errors and parse failures are not.
fn is_transient(error: &ProviderError) -> bool {
    match error {
        ProviderError::Transport { .. } => true,
        ProviderError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}
