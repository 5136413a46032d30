//! OpenAI-compatible chat-completion client.
//!
//! `POST {base_url}/chat/completions` with bearer auth. Streaming responses
//! are server-sent events: one `data: <json>` line per delta, terminated by
//! `data: [DONE]`.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use deliberation::{ChatMessage, GenerationClient, GenerationError, TextStream};
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ProviderConfig;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

/// Incremental decoder for a chat-completion event stream.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network chunks decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the content deltas completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(&line) {
                deltas.push(delta);
            }
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        deltas
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        let delta = if self.done { None } else { self.decode_line(&rest) };
        self.done = true;
        delta.into_iter().collect()
    }

    /// Whether `[DONE]` was seen or the decoder was finished.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let payload = line.strip_prefix("data:")?.trim();
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }
        let event: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping undecodable event");
                return None;
            }
        };
        event["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

struct SseState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    produced: bool,
    finished: bool,
}

/// Turn a raw event-stream body into a [`TextStream`] of content deltas.
///
/// A body that ends without yielding any text fails with
/// [`GenerationError::EmptyResponse`]; a body error is yielded once and ends
/// the stream.
pub fn sse_text_stream<S, B, E>(body: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        produced: false,
        finished: false,
    };
    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.pending.pop_front() {
                st.produced = true;
                return Some((Ok(delta), st));
            }
            if st.finished {
                return None;
            }
            if st.decoder.is_done() {
                st.finished = true;
                if !st.produced {
                    return Some((Err(GenerationError::EmptyResponse), st));
                }
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let deltas = st.decoder.push(bytes.as_ref());
                    st.pending.extend(deltas);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(GenerationError::transport(e.to_string())), st));
                }
                None => {
                    let deltas = st.decoder.finish();
                    st.pending.extend(deltas);
                }
            }
        }
    });
    Box::pin(stream)
}

/// Map a non-success HTTP status to the generation error taxonomy.
fn status_error(status: StatusCode, body: &str) -> GenerationError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        GenerationError::Transport(detail)
    } else {
        GenerationError::Configuration(detail)
    }
}

/// Streaming client for SiliconFlow and other OpenAI-compatible endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatClient {
    pub fn new(config: &ProviderConfig, api_key: &str) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GenerationError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, GenerationError> {
        let request = ChatRequest {
            model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        };
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(model, status = status.as_u16(), "completion request rejected");
            return Err(status_error(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationClient for OpenAiCompatClient {
    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<TextStream, GenerationError> {
        debug!(model, turns = messages.len(), "opening completion stream");
        let response = self.send(messages, model, true).await?;
        Ok(sse_text_stream(response.bytes_stream()))
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<String, GenerationError> {
        let response = self.send(messages, model, false).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::transport(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if content.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(content)
    }
}
