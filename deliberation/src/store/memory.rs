//! In-process store backed by a tokio `RwLock`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{AgentRoster, MessageLog, StoreError, StoreResult};
use crate::model::{
    Agent, AgentId, Discussion, DiscussionId, DiscussionStatus, Message, MessageKind,
};

/// The whole persisted state: agents, discussions and the message log.
///
/// Shared by [`MemoryStore`] and [`super::file::JsonFileStore`]; the latter
/// serializes it verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    pub agents: Vec<Agent>,
    pub discussions: BTreeMap<DiscussionId, Discussion>,
    pub messages: Vec<Message>,
    next_agent_id: u64,
    next_discussion_id: u64,
    next_message_id: u64,
}

impl StoreDocument {
    pub fn create_agent(
        &mut self,
        name: &str,
        role: &str,
        system_prompt: &str,
        model: &str,
    ) -> Agent {
        self.next_agent_id += 1;
        let agent = Agent {
            id: self.next_agent_id,
            name: name.to_string(),
            role: role.to_string(),
            system_prompt: system_prompt.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
        };
        self.agents.push(agent.clone());
        agent
    }

    pub fn create_discussion(&mut self, topic: &str) -> Discussion {
        self.next_discussion_id += 1;
        let discussion = Discussion {
            id: self.next_discussion_id,
            topic: topic.to_string(),
            status: DiscussionStatus::InProgress,
            summary: None,
            created_at: Utc::now(),
        };
        self.discussions.insert(discussion.id, discussion.clone());
        discussion
    }

    /// Remove a discussion together with all of its messages.
    pub fn delete_discussion(&mut self, id: DiscussionId) -> StoreResult<()> {
        self.discussions
            .remove(&id)
            .ok_or_else(|| StoreError::discussion(id))?;
        self.messages.retain(|m| m.discussion_id != id);
        Ok(())
    }

    pub fn append_message(
        &mut self,
        discussion_id: DiscussionId,
        agent_id: Option<AgentId>,
        content: &str,
        kind: MessageKind,
    ) -> StoreResult<Message> {
        if !self.discussions.contains_key(&discussion_id) {
            return Err(StoreError::discussion(discussion_id));
        }
        self.next_message_id += 1;
        let message = Message {
            id: self.next_message_id,
            discussion_id,
            agent_id,
            kind,
            content: content.to_string(),
            seq: self.next_message_id,
            created_at: Utc::now(),
        };
        self.messages.push(message.clone());
        Ok(message)
    }

    pub fn list_messages(&self, discussion_id: DiscussionId) -> StoreResult<Vec<Message>> {
        if !self.discussions.contains_key(&discussion_id) {
            return Err(StoreError::discussion(discussion_id));
        }
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.discussion_id == discussion_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    pub fn get_discussion(&self, id: DiscussionId) -> StoreResult<Discussion> {
        self.discussions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::discussion(id))
    }

    pub fn discussion_mut(&mut self, id: DiscussionId) -> StoreResult<&mut Discussion> {
        self.discussions
            .get_mut(&id)
            .ok_or_else(|| StoreError::discussion(id))
    }

    pub fn get_agent(&self, id: AgentId) -> StoreResult<Agent> {
        self.agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| StoreError::agent(id))
    }

    /// Point one agent, or every agent when `id` is `None`, at `model`.
    /// Returns the updated agents in roster order.
    pub fn set_agent_model(
        &mut self,
        id: Option<AgentId>,
        model: &str,
    ) -> StoreResult<Vec<Agent>> {
        if let Some(id) = id {
            if !self.agents.iter().any(|a| a.id == id) {
                return Err(StoreError::agent(id));
            }
        }
        let mut updated = Vec::new();
        for agent in self
            .agents
            .iter_mut()
            .filter(|a| id.map_or(true, |id| a.id == id))
        {
            agent.model = model.to_string();
            updated.push(agent.clone());
        }
        Ok(updated)
    }

    pub fn list_discussions(&self) -> Vec<Discussion> {
        let mut discussions: Vec<Discussion> = self.discussions.values().cloned().collect();
        discussions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        discussions
    }
}

/// Shared reference to a MemoryStore
pub type SharedMemoryStore = Arc<MemoryStore>;

/// In-memory message log and roster.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: RwLock<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedMemoryStore {
        Arc::new(self)
    }

    pub async fn create_agent(
        &self,
        name: &str,
        role: &str,
        system_prompt: &str,
        model: &str,
    ) -> Agent {
        self.doc
            .write()
            .await
            .create_agent(name, role, system_prompt, model)
    }

    pub async fn create_discussion(&self, topic: &str) -> Discussion {
        self.doc.write().await.create_discussion(topic)
    }

    pub async fn delete_discussion(&self, id: DiscussionId) -> StoreResult<()> {
        self.doc.write().await.delete_discussion(id)
    }

    /// Number of messages across all discussions.
    pub async fn message_count(&self) -> usize {
        self.doc.read().await.messages.len()
    }
}

#[async_trait]
impl MessageLog for MemoryStore {
    async fn append_message(
        &self,
        discussion_id: DiscussionId,
        agent_id: Option<AgentId>,
        content: &str,
        kind: MessageKind,
    ) -> StoreResult<Message> {
        self.doc
            .write()
            .await
            .append_message(discussion_id, agent_id, content, kind)
    }

    async fn list_messages(&self, discussion_id: DiscussionId) -> StoreResult<Vec<Message>> {
        self.doc.read().await.list_messages(discussion_id)
    }

    async fn get_discussion(&self, id: DiscussionId) -> StoreResult<Discussion> {
        self.doc.read().await.get_discussion(id)
    }

    async fn set_status(&self, id: DiscussionId, status: DiscussionStatus) -> StoreResult<()> {
        self.doc.write().await.discussion_mut(id)?.status = status;
        Ok(())
    }

    async fn set_summary(&self, id: DiscussionId, summary: &str) -> StoreResult<()> {
        self.doc.write().await.discussion_mut(id)?.summary = Some(summary.to_string());
        Ok(())
    }
}

#[async_trait]
impl AgentRoster for MemoryStore {
    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self.doc.read().await.agents.clone())
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Agent> {
        self.doc.read().await.get_agent(id)
    }
}
