//! JSON file store: the whole [`StoreDocument`] under a schema version,
//! rewritten after every mutation. The in-memory document only changes once
//! the rewrite has landed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::memory::StoreDocument;
use super::{AgentRoster, MessageLog, StoreError, StoreResult};
use crate::model::{
    Agent, AgentId, Discussion, DiscussionId, DiscussionStatus, Message, MessageKind,
};

#[derive(Deserialize)]
struct PersistedStore {
    version: u32,
    store: StoreDocument,
}

#[derive(Serialize)]
struct PersistedStoreRef<'a> {
    version: u32,
    store: &'a StoreDocument,
}

/// File-backed message log and roster.
///
/// Writes go to `<path>.tmp` first and are renamed over the target while the
/// document lock is held, so readers of the file never see a torn document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
}

impl JsonFileStore {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Open the store at `path`, starting empty when the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(json) => Self::decode(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %path.display(),
            agents = doc.agents.len(),
            discussions = doc.discussions.len(),
            "opened store"
        );
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(json: &str) -> StoreResult<StoreDocument> {
        let persisted: PersistedStore =
            serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if persisted.version > Self::CURRENT_VERSION {
            return Err(StoreError::VersionMismatch {
                supported: Self::CURRENT_VERSION,
                found: persisted.version,
            });
        }
        Ok(persisted.store)
    }

    async fn save(&self, doc: &StoreDocument) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(&PersistedStoreRef {
            version: Self::CURRENT_VERSION,
            store: doc,
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `change` to a copy of the document; the copy replaces the live
    /// document only after it was saved.
    async fn mutate<T, F>(&self, change: F) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreDocument) -> StoreResult<T> + Send,
        T: Send,
    {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        let out = change(&mut next)?;
        self.save(&next).await?;
        *doc = next;
        Ok(out)
    }

    pub async fn create_agent(
        &self,
        name: &str,
        role: &str,
        system_prompt: &str,
        model: &str,
    ) -> StoreResult<Agent> {
        self.mutate(|doc| Ok(doc.create_agent(name, role, system_prompt, model)))
            .await
    }

    pub async fn create_discussion(&self, topic: &str) -> StoreResult<Discussion> {
        self.mutate(|doc| Ok(doc.create_discussion(topic))).await
    }

    pub async fn delete_discussion(&self, id: DiscussionId) -> StoreResult<()> {
        self.mutate(|doc| doc.delete_discussion(id)).await
    }

    /// Change the preferred model of one agent, or of the whole roster.
    pub async fn set_agent_model(
        &self,
        id: Option<AgentId>,
        model: &str,
    ) -> StoreResult<Vec<Agent>> {
        self.mutate(|doc| doc.set_agent_model(id, model)).await
    }

    /// All discussions, newest first.
    pub async fn list_discussions(&self) -> Vec<Discussion> {
        self.doc.lock().await.list_discussions()
    }
}

#[async_trait]
impl MessageLog for JsonFileStore {
    async fn append_message(
        &self,
        discussion_id: DiscussionId,
        agent_id: Option<AgentId>,
        content: &str,
        kind: MessageKind,
    ) -> StoreResult<Message> {
        self.mutate(|doc| doc.append_message(discussion_id, agent_id, content, kind))
            .await
    }

    async fn list_messages(&self, discussion_id: DiscussionId) -> StoreResult<Vec<Message>> {
        self.doc.lock().await.list_messages(discussion_id)
    }

    async fn get_discussion(&self, id: DiscussionId) -> StoreResult<Discussion> {
        self.doc.lock().await.get_discussion(id)
    }

    async fn set_status(&self, id: DiscussionId, status: DiscussionStatus) -> StoreResult<()> {
        self.mutate(|doc| {
            doc.discussion_mut(id)?.status = status;
            Ok(())
        })
        .await
    }

    async fn set_summary(&self, id: DiscussionId, summary: &str) -> StoreResult<()> {
        self.mutate(|doc| {
            doc.discussion_mut(id)?.summary = Some(summary.to_string());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AgentRoster for JsonFileStore {
    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self.doc.lock().await.agents.clone())
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Agent> {
        self.doc.lock().await.get_agent(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.json");

        let (discussion_id, agent_id) = {
            let store = JsonFileStore::open(&path).await.unwrap();
            let agent = store
                .create_agent("Risk", "risk manager", "watch drawdowns", "m1")
                .await
                .unwrap();
            let d = store.create_discussion("EV market outlook").await.unwrap();
            store
                .append_message(d.id, Some(agent.id), "hedge it", MessageKind::Agent)
                .await
                .unwrap();
            (d.id, agent.id)
        };

        let store = JsonFileStore::open(&path).await.unwrap();
        let messages = store.list_messages(discussion_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_turn_of(agent_id));

        // Ids keep counting after a reopen.
        let d2 = store.create_discussion("rates").await.unwrap();
        assert!(d2.id > discussion_id);
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(store.list_agents().await.unwrap().is_empty());
        assert!(store.list_discussions().await.is_empty());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        store.create_discussion("t").await.unwrap();
        drop(store);

        let json = std::fs::read_to_string(&path).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["version"] = serde_json::json!(99);
        std::fs::write(&path, value.to_string()).unwrap();

        match JsonFileStore::open(&path).await {
            Err(StoreError::VersionMismatch { supported, found }) => {
                assert_eq!(supported, 1);
                assert_eq!(found, 99);
            }
            other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_garbage_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_status_change_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        let d = store.create_discussion("t").await.unwrap();
        store
            .set_status(d.id, DiscussionStatus::Paused)
            .await
            .unwrap();
        drop(store);

        let store = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            store.get_discussion(d.id).await.unwrap().status,
            DiscussionStatus::Paused
        );
        assert!(!dir.path().join("status.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        let d = store.create_discussion("rates").await.unwrap();

        // A directory where the temp file should go makes every save fail.
        let tmp = dir.path().join("panel.json.tmp");
        std::fs::create_dir(&tmp).unwrap();

        let err = store
            .append_message(d.id, None, "lost", MessageKind::User)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store
            .set_status(d.id, DiscussionStatus::Completed)
            .await
            .is_err());
        assert!(store.list_messages(d.id).await.unwrap().is_empty());
        assert_eq!(
            store.get_discussion(d.id).await.unwrap().status,
            DiscussionStatus::InProgress
        );

        // Once the disk recovers, ids continue as if the failed write never happened.
        std::fs::remove_dir(&tmp).unwrap();
        let message = store
            .append_message(d.id, None, "kept", MessageKind::User)
            .await
            .unwrap();
        let reopened = JsonFileStore::open(&path).await.unwrap();
        let messages = reopened.list_messages(d.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, message.id);
        assert_eq!(messages[0].content, "kept");
    }

    #[tokio::test]
    async fn test_set_agent_model_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        let a = store.create_agent("A", "r", "s", "m1").await.unwrap();
        let b = store.create_agent("B", "r", "s", "m1").await.unwrap();

        let updated = store.set_agent_model(Some(b.id), "m2").await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, b.id);
        assert!(matches!(
            store.set_agent_model(Some(99), "m2").await,
            Err(StoreError::NotFound { kind: "agent", id: 99 })
        ));

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_agent(a.id).await.unwrap().model, "m1");
        assert_eq!(reopened.get_agent(b.id).await.unwrap().model, "m2");

        let updated = reopened.set_agent_model(None, "m3").await.unwrap();
        assert_eq!(updated.len(), 2);
        let models: Vec<String> = reopened
            .list_agents()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.model)
            .collect();
        assert_eq!(models, vec!["m3", "m3"]);
    }
}
