mod file;
mod memory;
mod redis;
mod store;

pub use file::FileHistoryBackend;
pub use memory::MemoryHistoryBackend;
pub use self::redis::RedisHistoryBackend;
pub use store::ConversationStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Args;
use crate::models::chat::Conversation;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history I/O error: {0}")] Io(#[from] std::io::Error),
    #[error("history record could not be encoded or decoded: {0}")] Serde(
        #[from] serde_json::Error,
    ),
    #[error("redis history error: {0}")] Redis(#[from] ::redis::RedisError),
    #[error("unsupported history store type: {0}")] UnsupportedBackend(String),
    #[error("history storage unavailable: {0}")] Unavailable(String),
}

/// Durable storage for whole conversation records. Implementations hold no cache;
/// [`ConversationStore`] layers caching and locking on top.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Returns `Ok(None)` when no record exists for `id`.
    async fn read(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Replaces the stored record for `conversation.id`.
    async fn write(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Returns whether a record existed and was removed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}

pub async fn create_history_backend(
    args: &Args
) -> Result<Arc<dyn HistoryBackend>, StoreError> {
    match args.history_type.to_lowercase().as_str() {
        "file" => {
            let backend = FileHistoryBackend::open(&args.storage_dir).await?;
            Ok(Arc::new(backend))
        }
        "redis" => {
            let backend = RedisHistoryBackend::new(
                &args.history_host,
                args.history_redis_prefix.clone(),
                args.history_redis_scan_count
            )?;
            Ok(Arc::new(backend))
        }
        "memory" => Ok(Arc::new(MemoryHistoryBackend::new())),
        other => Err(StoreError::UnsupportedBackend(other.to_string())),
    }
}

pub async fn initialize_conversation_store(
    args: &Args
) -> Result<Arc<ConversationStore>, StoreError> {
    let location = match args.history_type.to_lowercase().as_str() {
        "file" => args.storage_dir.as_str(),
        "redis" => args.history_host.as_str(),
        _ => "process memory",
    };
    info!("Chat history will be stored in: {} at {}", args.history_type, location);
    let backend = create_history_backend(args).await?;
    Ok(Arc::new(ConversationStore::new(backend)))
}
