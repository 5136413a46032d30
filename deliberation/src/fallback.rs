//! Fallback Executor: one determinate outcome per agent per round.
//!
//! Candidates are tried in order (preferred, secondary, baseline, duplicates
//! removed). A candidate succeeds when its accumulated text is non-blank.
//! Transport failures have already been retried by the client before they
//! reach this layer; empty output moves straight to the next candidate.
//! Whatever the result, exactly one agent-kind message is persisted for the
//! turn, failure text included. A turn whose message cannot be written is
//! not settled: the store error goes back to the caller.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::context::AgentContext;
use crate::generation::{ChatMessage, GenerationError, SharedGenerationClient};
use crate::model::{Agent, DiscussionId, MessageId, MessageKind};
use crate::store::{SharedMessageLog, StoreResult};

/// Ordered, de-duplicated list of models to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateChain {
    models: Vec<String>,
}

impl CandidateChain {
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for model in models {
            let model = model.into();
            if !model.trim().is_empty() && !out.contains(&model) {
                out.push(model);
            }
        }
        Self { models: out }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Final result of an agent's turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum TurnResult {
    Success(String),
    /// Human-readable reason; also the persisted message content.
    Failure(String),
}

impl TurnResult {
    pub fn text(&self) -> &str {
        match self {
            Self::Success(text) | Self::Failure(text) => text,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Served,
    Empty,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model: String,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
}

/// Settled outcome of one agent's turn.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub agent: Agent,
    pub result: TurnResult,
    /// Model that produced a successful result.
    pub served_by: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    /// Id of the persisted message; `None` only for outcomes that were
    /// never handed to the log.
    pub message_id: Option<MessageId>,
}

impl RoundOutcome {
    /// Outcome for a turn that never settled normally (task panic, abort).
    pub fn failed(agent: Agent, reason: impl Into<String>) -> Self {
        Self {
            agent,
            result: TurnResult::Failure(reason.into()),
            served_by: None,
            attempts: Vec::new(),
            message_id: None,
        }
    }
}

/// Runs an agent turn against its candidate chain and persists the result.
pub struct FallbackExecutor {
    client: SharedGenerationClient,
    log: SharedMessageLog,
    secondary_model: String,
    baseline_model: String,
    candidate_timeout: Duration,
    turn_timeout: Duration,
}

impl FallbackExecutor {
    pub fn new(
        client: SharedGenerationClient,
        log: SharedMessageLog,
        secondary_model: impl Into<String>,
        baseline_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            log,
            secondary_model: secondary_model.into(),
            baseline_model: baseline_model.into(),
            candidate_timeout: Duration::from_secs(90),
            turn_timeout: Duration::from_secs(180),
        }
    }

    /// Ceiling for a single candidate; overrun counts as a transport failure.
    pub fn with_candidate_timeout(mut self, timeout: Duration) -> Self {
        self.candidate_timeout = timeout;
        self
    }

    /// Ceiling for the whole turn across all candidates.
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn chain_for(&self, agent: &Agent) -> CandidateChain {
        CandidateChain::new([
            agent.model.as_str(),
            self.secondary_model.as_str(),
            self.baseline_model.as_str(),
        ])
    }

    /// Generate and persist one turn. Generation errors end up in the
    /// returned outcome; only a failed write is an error.
    pub async fn run(
        &self,
        discussion_id: DiscussionId,
        agent: &Agent,
        context: &AgentContext,
    ) -> StoreResult<RoundOutcome> {
        let chain = self.chain_for(agent);
        let mut attempts = Vec::with_capacity(chain.len());

        let generated = tokio::time::timeout(
            self.turn_timeout,
            self.generate(agent, context.messages(), &chain, &mut attempts),
        )
        .await;

        let (result, served_by) = match generated {
            Ok(Ok((text, model))) => (TurnResult::Success(text), Some(model)),
            Ok(Err(reason)) => (TurnResult::Failure(reason), None),
            Err(_) => {
                warn!(
                    agent_id = agent.id,
                    timeout_secs = self.turn_timeout.as_secs(),
                    "agent turn exceeded its ceiling"
                );
                (
                    TurnResult::Failure(format!(
                        "Error: turn timed out after {}s",
                        self.turn_timeout.as_secs()
                    )),
                    None,
                )
            }
        };

        let message_id = self.persist(discussion_id, agent, result.text()).await?;
        Ok(RoundOutcome {
            agent: agent.clone(),
            result,
            served_by,
            attempts,
            message_id: Some(message_id),
        })
    }

    /// Persist a failure for a turn whose task never settled.
    pub async fn settle_failure(
        &self,
        discussion_id: DiscussionId,
        agent: Agent,
        reason: impl Into<String>,
    ) -> StoreResult<RoundOutcome> {
        let mut outcome = RoundOutcome::failed(agent, reason);
        let message_id = self
            .persist(discussion_id, &outcome.agent, outcome.result.text())
            .await?;
        outcome.message_id = Some(message_id);
        Ok(outcome)
    }

    async fn persist(
        &self,
        discussion_id: DiscussionId,
        agent: &Agent,
        text: &str,
    ) -> StoreResult<MessageId> {
        self.log
            .append_message(discussion_id, Some(agent.id), text, MessageKind::Agent)
            .await
            .map(|message| message.id)
            .map_err(|e| {
                error!(agent_id = agent.id, discussion_id, error = %e, "failed to persist turn");
                e
            })
    }

    async fn generate(
        &self,
        agent: &Agent,
        messages: &[ChatMessage],
        chain: &CandidateChain,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<(String, String), String> {
        let mut last_error = GenerationError::EmptyResponse;
        for model in chain.models() {
            let started = Instant::now();
            let result = self.try_candidate(messages, model).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(text) => {
                    debug!(agent_id = agent.id, model = %model, elapsed_ms, "candidate served turn");
                    attempts.push(AttemptRecord {
                        model: model.clone(),
                        outcome: AttemptOutcome::Served,
                        elapsed_ms,
                    });
                    return Ok((text, model.clone()));
                }
                Err(e) => {
                    warn!(agent_id = agent.id, model = %model, error = %e, "candidate failed");
                    attempts.push(AttemptRecord {
                        model: model.clone(),
                        outcome: match e {
                            GenerationError::EmptyResponse => AttemptOutcome::Empty,
                            ref other => AttemptOutcome::Failed(other.to_string()),
                        },
                        elapsed_ms,
                    });
                    last_error = e;
                }
            }
        }
        Err(format!(
            "Error: {} (tried {} models)",
            last_error,
            chain.len()
        ))
    }

    async fn try_candidate(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<String, GenerationError> {
        let attempt = async {
            let mut stream = self.client.stream_complete(messages, model).await?;
            let mut text = String::new();
            while let Some(fragment) = stream.next().await {
                text.push_str(&fragment?);
            }
            if text.trim().is_empty() {
                return Err(GenerationError::EmptyResponse);
            }
            Ok(text)
        };
        tokio::time::timeout(self.candidate_timeout, attempt)
            .await
            .map_err(|_| GenerationError::Timeout(self.candidate_timeout))?
    }
}
