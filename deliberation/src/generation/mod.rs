//! Generation client seam.
//!
//! A [`GenerationClient`] turns a role-tagged message sequence into a lazy,
//! finite stream of text fragments for a named model. Everything above this
//! trait (fallback, fan-out, multiplexing) is backend-agnostic; the HTTP
//! implementation lives in the agents crate.
//!
//! ## Error classes
//!
//! | Variant         | Retriable on the same model | Next step            |
//! |-----------------|-----------------------------|----------------------|
//! | Transport       | yes                         | retry, then fallback |
//! | Timeout         | yes                         | retry, then fallback |
//! | EmptyResponse   | no                          | fallback             |
//! | Configuration   | no                          | fallback             |

pub mod retry;
pub mod scripted;

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speaker of a context turn, as understood by chat-completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One role-tagged turn sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Classification used by the retry decorator and the fallback executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network or backend failure; safe to retry with backoff.
    Transient,
    /// The model answered with nothing; move to the next candidate.
    Empty,
    /// The client cannot work with this request at all.
    Misconfigured,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Empty => write!(f, "empty"),
            Self::Misconfigured => write!(f, "misconfigured"),
        }
    }
}

/// Errors surfaced by a generation client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Connection, HTTP status or mid-stream read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The stream finished without any non-whitespace text.
    #[error("empty response")]
    EmptyResponse,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GenerationError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }

    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Transport(_) | Self::Timeout(_) => RetryCategory::Transient,
            Self::EmptyResponse => RetryCategory::Empty,
            Self::Configuration(_) => RetryCategory::Misconfigured,
        }
    }

    /// Returns `true` if the same model may be asked again.
    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}

/// Lazy sequence of text fragments.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Streaming completion backend addressed by model identifier.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Open a streaming completion. Errors returned here happened before any
    /// text was produced; errors yielded by the stream happened mid-response.
    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<TextStream, GenerationError>;

    /// Single-shot completion. The default drains [`Self::stream_complete`].
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<String, GenerationError> {
        let mut stream = self.stream_complete(messages, model).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Shared reference to a generation client
pub type SharedGenerationClient = std::sync::Arc<dyn GenerationClient>;
