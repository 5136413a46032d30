//! Invocation-level error taxonomy.
//!
//! Per-agent failures (including exhausted fallback chains) never show up
//! here; they settle as [`crate::fallback::TurnResult::Failure`]. What does
//! show up ends the whole invocation.

use thiserror::Error;

use crate::events::ClientGone;
use crate::fanout::RoundError;
use crate::generation::GenerationError;
use crate::model::{AgentId, DiscussionId};
use crate::state::TransitionError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DeliberationError {
    /// Unknown discussion or agent; raised before any generation.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("no agents available")]
    NoAgents,

    #[error("discussion {0} has no agent messages to summarize")]
    NothingToSummarize(DiscussionId),

    #[error("store error: {0}")]
    Store(StoreError),

    /// A non-agent generation (summary, ping) failed.
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    /// The client went away or the run was cancelled.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid phase transition: {0}")]
    State(#[from] TransitionError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DeliberationError {
    pub fn discussion(id: DiscussionId) -> Self {
        Self::NotFound {
            kind: "discussion",
            id,
        }
    }

    pub fn agent(id: AgentId) -> Self {
        Self::NotFound { kind: "agent", id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for DeliberationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::Store(other),
        }
    }
}

impl From<ClientGone> for DeliberationError {
    fn from(_: ClientGone) -> Self {
        Self::Cancelled
    }
}

impl From<RoundError> for DeliberationError {
    fn from(err: RoundError) -> Self {
        match err {
            RoundError::Cancelled => Self::Cancelled,
            RoundError::Store(e) => e.into(),
        }
    }
}

/// Result type for orchestrator operations
pub type DeliberationResult<T> = Result<T, DeliberationError>;
