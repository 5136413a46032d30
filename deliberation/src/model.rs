//! Panel data model: agents, discussions and the append-only message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent identifier.
pub type AgentId = u64;

/// Discussion identifier.
pub type DiscussionId = u64;

/// Message identifier.
pub type MessageId = u64;

/// A configured persona taking part in a deliberation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Display name shown to clients and used in peer attribution tags.
    pub name: String,
    /// Short role label (e.g. "Macro strategist").
    pub role: String,
    /// System instruction that opens every context built for this agent.
    pub system_prompt: String,
    /// Preferred model identifier, first candidate of the fallback chain.
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a discussion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    InProgress,
    Paused,
    Completed,
}

impl std::fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A topic under deliberation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discussion {
    pub id: DiscussionId,
    pub topic: String,
    pub status: DiscussionStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Written by the human participant.
    User,
    /// A finished agent turn (including persisted failure text).
    Agent,
    /// A discussion summary.
    Summary,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::Summary => write!(f, "summary"),
        }
    }
}

/// One immutable entry of a discussion's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub discussion_id: DiscussionId,
    /// `None` for user-authored messages.
    pub agent_id: Option<AgentId>,
    pub kind: MessageKind,
    pub content: String,
    /// Store-wide monotonically increasing creation order.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether this is an agent turn authored by `agent_id`.
    pub fn is_turn_of(&self, agent_id: AgentId) -> bool {
        self.kind == MessageKind::Agent && self.agent_id == Some(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&DiscussionStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(DiscussionStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_is_turn_of() {
        let msg = Message {
            id: 1,
            discussion_id: 1,
            agent_id: Some(7),
            kind: MessageKind::Agent,
            content: "bullish".to_string(),
            seq: 1,
            created_at: Utc::now(),
        };
        assert!(msg.is_turn_of(7));
        assert!(!msg.is_turn_of(8));

        let user = Message {
            agent_id: None,
            kind: MessageKind::User,
            ..msg
        };
        assert!(!user.is_turn_of(7));
    }
}
