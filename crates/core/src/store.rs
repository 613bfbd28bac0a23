//! Chat store: the collaborator that owns persisted conversations.
//!
//! The generation pipeline only reads the active history of a chat and
//! appends finished turns; everything else about chat storage lives
//! outside this workspace.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::history::{HistoryEntry, MAX_HISTORY_ENTRIES, normalize_history};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// The normalized history window of `chat_id`, at most `limit` entries.
    async fn active_history(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Append a finished turn to `chat_id`.
    async fn persist_turn(&self, chat_id: &str, entry: HistoryEntry) -> Result<(), StoreError>;

    /// Human-readable chat title, if the store tracks one.
    async fn chat_title(&self, _chat_id: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    /// Rename a chat. Stores without titles ignore this.
    async fn set_chat_title(&self, _chat_id: &str, _title: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A process-local store used by the CLI and tests.
#[derive(Default)]
pub struct InMemoryChatStore {
    chats: RwLock<HashMap<String, ChatRecord>>,
}

#[derive(Default)]
struct ChatRecord {
    title: Option<String>,
    entries: Vec<HistoryEntry>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a chat with existing entries.
    pub async fn seed(&self, chat_id: &str, entries: Vec<HistoryEntry>) {
        let mut chats = self.chats.write().await;
        chats.entry(chat_id.to_string()).or_default().entries.extend(entries);
    }

    /// Every entry of `chat_id`, unnormalized.
    pub async fn entries(&self, chat_id: &str) -> Vec<HistoryEntry> {
        let chats = self.chats.read().await;
        chats
            .get(chat_id)
            .map(|c| c.entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn active_history(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let chats = self.chats.read().await;
        Ok(chats
            .get(chat_id)
            .map(|c| normalize_history(&c.entries, limit.min(MAX_HISTORY_ENTRIES)))
            .unwrap_or_default())
    }

    async fn persist_turn(&self, chat_id: &str, entry: HistoryEntry) -> Result<(), StoreError> {
        let mut chats = self.chats.write().await;
        chats.entry(chat_id.to_string()).or_default().entries.push(entry);
        Ok(())
    }

    async fn chat_title(&self, chat_id: &str) -> Result<Option<String>, StoreError> {
        let chats = self.chats.read().await;
        Ok(chats.get(chat_id).and_then(|c| c.title.clone()))
    }

    async fn set_chat_title(&self, chat_id: &str, title: &str) -> Result<(), StoreError> {
        let mut chats = self.chats.write().await;
        chats.entry(chat_id.to_string()).or_default().title = Some(title.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persisted_turns_show_up_in_history() {
        let store = InMemoryChatStore::new();
        store.persist_turn("c1", HistoryEntry::user("hi")).await.unwrap();
        store
            .persist_turn("c1", HistoryEntry::assistant("hello"))
            .await
            .unwrap();

        let history = store.active_history("c1", MAX_HISTORY_ENTRIES).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(store.active_history("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_normalized() {
        let store = InMemoryChatStore::new();
        store
            .seed(
                "c1",
                (0..30).map(|i| HistoryEntry::user(format!(" m{i} "))).collect(),
            )
            .await;
        let history = store.active_history("c1", 100).await.unwrap();
        assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(history.last().unwrap().text, "m29");
        assert_eq!(store.entries("c1").await.len(), 30);
    }

    #[tokio::test]
    async fn titles_round_trip() {
        let store = InMemoryChatStore::new();
        assert!(store.chat_title("c1").await.unwrap().is_none());
        store.set_chat_title("c1", "Plans").await.unwrap();
        assert_eq!(store.chat_title("c1").await.unwrap().as_deref(), Some("Plans"));
    }
}
