//! Persistence collaborators: the append-only message log and the agent roster.
//!
//! The orchestrator only appends messages and flips discussion status/summary;
//! existing messages are never rewritten. Two implementations ship with the
//! crate:
//!
//! - [`memory::MemoryStore`]: in-process, used by tests and offline runs
//! - [`file::JsonFileStore`]: a versioned JSON document rewritten on every mutation

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{
    Agent, AgentId, Discussion, DiscussionId, DiscussionStatus, Message, MessageKind,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store document version {found} is newer than supported version {supported}")]
    VersionMismatch { supported: u32, found: u32 },
}

impl StoreError {
    pub fn discussion(id: DiscussionId) -> Self {
        Self::NotFound {
            kind: "discussion",
            id,
        }
    }

    pub fn agent(id: AgentId) -> Self {
        Self::NotFound { kind: "agent", id }
    }

    /// Whether the error means the requested record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only message log keyed by discussion.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Append a message; the store assigns id, sequence number and timestamp.
    async fn append_message(
        &self,
        discussion_id: DiscussionId,
        agent_id: Option<AgentId>,
        content: &str,
        kind: MessageKind,
    ) -> StoreResult<Message>;

    /// All messages of a discussion in creation order.
    async fn list_messages(&self, discussion_id: DiscussionId) -> StoreResult<Vec<Message>>;

    async fn get_discussion(&self, id: DiscussionId) -> StoreResult<Discussion>;

    async fn set_status(&self, id: DiscussionId, status: DiscussionStatus) -> StoreResult<()>;

    async fn set_summary(&self, id: DiscussionId, summary: &str) -> StoreResult<()>;
}

/// Read access to the agents owned by the CRUD layer.
#[async_trait]
pub trait AgentRoster: Send + Sync {
    /// All agents in canonical (creation) order.
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    async fn get_agent(&self, id: AgentId) -> StoreResult<Agent>;
}

/// Shared reference to a message log
pub type SharedMessageLog = Arc<dyn MessageLog>;

/// Shared reference to an agent roster
pub type SharedAgentRoster = Arc<dyn AgentRoster>;
