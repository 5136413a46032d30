//! Deterministic in-process generation client.
//!
//! Replies are scripted per (system instruction, model) key, which makes it
//! possible to give each agent of a panel its own behaviour. Used by the
//! tests and by offline runs of the CLI.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatMessage, ChatRole, GenerationClient, GenerationError, TextStream};

/// Which requests a script applies to. `None` matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub system: Option<String>,
    pub model: Option<String>,
}

impl ScriptKey {
    pub fn exact(system: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            model: Some(model.into()),
        }
    }

    pub fn system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            model: None,
        }
    }

    pub fn model(model: impl Into<String>) -> Self {
        Self {
            system: None,
            model: Some(model.into()),
        }
    }

    pub fn any() -> Self {
        Self {
            system: None,
            model: None,
        }
    }
}

/// One scripted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Stream this text.
    Reply(String),
    /// Open the stream and end it without text.
    Empty,
    /// Fail before any text.
    Fail(String),
    /// Stream `prefix`, then fail.
    FailAfter { prefix: String, reason: String },
}

impl ScriptStep {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<ScriptStep>,
    /// Used once the queue is drained.
    repeat: Option<ScriptStep>,
    latency: Duration,
}

/// A request observed by the client.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl RecordedCall {
    /// The leading system instruction, if any.
    pub fn system(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<ScriptKey, Script>>,
    calls: Mutex<Vec<RecordedCall>>,
    fragment_chars: usize,
    echo: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedClient {
    /// Client whose unscripted requests fail with a transport error.
    pub fn new() -> Self {
        Self {
            fragment_chars: 16,
            ..Self::default()
        }
    }

    /// Client whose unscripted requests answer with a short deterministic
    /// echo of the request.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::new()
        }
    }

    /// Size of the fragments replies are streamed in.
    pub fn with_fragment_chars(mut self, n: usize) -> Self {
        self.fragment_chars = n.max(1);
        self
    }

    /// Queue a step for `key`.
    pub fn push(&self, key: ScriptKey, step: ScriptStep) {
        lock(&self.scripts)
            .entry(key)
            .or_default()
            .queue
            .push_back(step);
    }

    /// Answer every request for `key` with `step` once its queue is drained.
    pub fn always(&self, key: ScriptKey, step: ScriptStep) {
        lock(&self.scripts).entry(key).or_default().repeat = Some(step);
    }

    /// Delay before the stream for `key` opens.
    pub fn set_latency(&self, key: ScriptKey, latency: Duration) {
        lock(&self.scripts).entry(key).or_default().latency = latency;
    }

    /// Every request seen so far, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Requests whose system instruction equals `system`.
    pub fn calls_for(&self, system: &str) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.system() == Some(system))
            .cloned()
            .collect()
    }

    fn next_step(&self, system: Option<&str>, model: &str) -> (Option<ScriptStep>, Duration) {
        let candidates = [
            ScriptKey {
                system: system.map(str::to_string),
                model: Some(model.to_string()),
            },
            ScriptKey {
                system: system.map(str::to_string),
                model: None,
            },
            ScriptKey::model(model),
            ScriptKey::any(),
        ];
        let mut scripts = lock(&self.scripts);
        // Latency and replies resolve independently, most specific key first.
        let latency = candidates
            .iter()
            .filter_map(|key| scripts.get(key))
            .map(|script| script.latency)
            .find(|latency| !latency.is_zero())
            .unwrap_or_default();
        let step = candidates.iter().find_map(|key| {
            let script = scripts.get_mut(key)?;
            script.queue.pop_front().or_else(|| script.repeat.clone())
        });
        (step, latency)
    }

    fn echo_reply(messages: &[ChatMessage], model: &str) -> String {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let excerpt: String = last.chars().take(60).collect();
        format!("[{}] noted: {}", model, excerpt)
    }

    fn fragments(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.fragment_chars.max(1))
            .map(|c| c.iter().collect())
            .collect()
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<TextStream, GenerationError> {
        let call = RecordedCall {
            model: model.to_string(),
            messages: messages.to_vec(),
        };
        let (step, latency) = self.next_step(call.system(), model);
        lock(&self.calls).push(call);

        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        let step = match step {
            Some(step) => step,
            None if self.echo => ScriptStep::Reply(Self::echo_reply(messages, model)),
            None => {
                return Err(GenerationError::transport(format!(
                    "no scripted reply for model {}",
                    model
                )))
            }
        };

        let items: Vec<Result<String, GenerationError>> = match step {
            ScriptStep::Reply(text) => self.fragments(&text).into_iter().map(Ok).collect(),
            ScriptStep::Empty => Vec::new(),
            ScriptStep::Fail(reason) => return Err(GenerationError::Transport(reason)),
            ScriptStep::FailAfter { prefix, reason } => self
                .fragments(&prefix)
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(GenerationError::Transport(reason))))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_exact_key_wins_over_model_key() {
        let client = ScriptedClient::new();
        client.always(ScriptKey::model("m"), ScriptStep::reply("generic"));
        client.push(ScriptKey::exact("be brief", "m"), ScriptStep::reply("specific"));

        let ctx = [ChatMessage::system("be brief"), ChatMessage::user("q")];
        assert_eq!(client.complete(&ctx, "m").await.unwrap(), "specific");
        assert_eq!(client.complete(&ctx, "m").await.unwrap(), "generic");
        assert_eq!(client.calls_for("be brief").len(), 2);
    }

    #[tokio::test]
    async fn test_reply_is_fragmented() {
        let client = ScriptedClient::new().with_fragment_chars(4);
        client.push(ScriptKey::any(), ScriptStep::reply("abcdefghij"));
        let stream = client
            .stream_complete(&[ChatMessage::user("q")], "m")
            .await
            .unwrap();
        let parts: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(parts, vec!["abcd", "efgh", "ij"]);
    }

    #[tokio::test]
    async fn test_unscripted_request_fails_unless_echoing() {
        let strict = ScriptedClient::new();
        assert!(strict
            .complete(&[ChatMessage::user("q")], "m")
            .await
            .is_err());

        let echo = ScriptedClient::echo();
        let text = echo
            .complete(&[ChatMessage::user("rates?")], "m")
            .await
            .unwrap();
        assert_eq!(text, "[m] noted: rates?");
    }

    #[tokio::test]
    async fn test_empty_step_is_empty_response() {
        let client = ScriptedClient::new();
        client.push(ScriptKey::any(), ScriptStep::Empty);
        let err = client
            .complete(&[ChatMessage::user("q")], "m")
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::EmptyResponse);
    }
}
