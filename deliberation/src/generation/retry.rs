//! Bounded retry with exponential backoff around any [`GenerationClient`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatMessage, GenerationClient, GenerationError, TextStream};

/// Retry policy for transport-class failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per model, first try included.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff to wait after `attempt` failed attempts (1-indexed).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 1s initial backoff, 2x multiplier, 8s max.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
        }
    }
}

/// Decorator that retries transport failures occurring before the first
/// fragment. Once text has been yielded the stream is passed through as is;
/// a mid-response failure surfaces to the caller.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: GenerationClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Sleep before the next attempt, or hand back `err` when it is final.
    async fn back_off(
        &self,
        model: &str,
        attempt: u32,
        err: GenerationError,
    ) -> Result<(), GenerationError> {
        if !err.is_retriable() || !self.policy.should_retry(attempt) {
            return Err(err);
        }
        let delay = self.policy.backoff_duration(attempt);
        warn!(
            model,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "generation attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[async_trait]
impl<C: GenerationClient> GenerationClient for RetryingClient<C> {
    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<TextStream, GenerationError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.inner.stream_complete(messages, model).await {
                Ok(mut stream) => match stream.next().await {
                    Some(Ok(first)) => {
                        debug!(model, attempt, "generation stream opened");
                        let head = futures::stream::once(async move { Ok(first) });
                        return Ok(Box::pin(head.chain(stream)));
                    }
                    None => return Ok(Box::pin(futures::stream::empty())),
                    Some(Err(e)) => e,
                },
                Err(e) => e,
            };
            self.back_off(model, attempt, err).await?;
        }
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<String, GenerationError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.complete(messages, model).await {
                Ok(text) => return Ok(text),
                Err(err) => self.back_off(model, attempt, err).await?,
            }
        }
    }
}
