use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use crate::history::{ HistoryBackend, StoreError };
use crate::models::chat::Conversation;

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryHistoryBackend {
    records: RwLock<HashMap<String, Conversation>>,
}

impl MemoryHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryBackend for MemoryHistoryBackend {
    async fn read(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.records.write().await.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}
