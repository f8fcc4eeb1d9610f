use chrono::{ Duration, Utc };
use log::{ debug, error, info, warn };
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{ Mutex, RwLock };
use uuid::Uuid;
use crate::history::{ HistoryBackend, StoreError };
use crate::models::chat::{
    ChatMessage,
    Conversation,
    ConversationSummary,
    HistoryEntry,
    Metadata,
    Role,
};

/// Conversation records with a write-through cache over a [`HistoryBackend`].
///
/// The backend is authoritative. Every mutation is persisted before the cache is
/// updated, and a failed write evicts the cached entry for that id. Mutations of one
/// conversation are serialized by a per-id lock; different ids never contend.
pub struct ConversationStore {
    backend: Arc<dyn HistoryBackend>,
    cache: RwLock<HashMap<String, Conversation>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Only canonical dashed UUIDs name a conversation.
fn is_valid_id(id: &str) -> bool {
    Uuid::parse_str(id)
        .map(|uuid| uuid.hyphenated().to_string() == id)
        .unwrap_or(false)
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn evict(&self, id: &str) {
        self.cache.write().await.remove(id);
    }

    /// Creates and persists an empty conversation, returning its new id.
    pub async fn create(&self) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let conversation = Conversation::new(id.clone());

        if let Err(e) = self.backend.write(&conversation).await {
            error!("STORAGE: Failed to persist new conversation {}: {}", id, e);
            self.evict(&id).await;
            return Err(e);
        }

        self.cache.write().await.insert(id.clone(), conversation);
        info!("STORAGE: Created conversation {}", id);
        Ok(id)
    }

    /// Releases the per-id lock entry once no other task holds or waits on it.
    async fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
        drop(lock);
    }

    /// Cached copy, else a backend read that does not populate the cache.
    async fn peek(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        if let Some(conversation) = self.cache.read().await.get(id) {
            return Ok(Some(conversation.clone()));
        }
        self.backend.read(id).await
    }

    /// Returns `Ok(None)` for unknown ids and for ids that are not canonical UUIDs.
    pub async fn load(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        if !is_valid_id(id) {
            debug!("STORAGE: Ignoring malformed conversation id: {}", id);
            return Ok(None);
        }

        if let Some(conversation) = self.cache.read().await.get(id) {
            return Ok(Some(conversation.clone()));
        }

        let Some(stored) = self.backend.read(id).await? else {
            return Ok(None);
        };
        debug!(
            "STORAGE: Loaded conversation {} with {} messages from storage",
            id,
            stored.messages.len()
        );
        // A concurrent append may have cached a newer copy while we were reading.
        let cached = self.cache.write().await.entry(id.to_string()).or_insert(stored).clone();
        Ok(Some(cached))
    }

    /// Appends one message. `Ok(false)` means the conversation does not exist or the
    /// post-write verification did not see the new message.
    pub async fn append(
        &self,
        id: &str,
        role: Role,
        content: &str,
        metadata: Option<Metadata>
    ) -> Result<bool, StoreError> {
        if !is_valid_id(id) {
            return Ok(false);
        }

        let lock = self.lock_for(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.append_locked(id, role, content, metadata).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn append_locked(
        &self,
        id: &str,
        role: Role,
        content: &str,
        metadata: Option<Metadata>
    ) -> Result<bool, StoreError> {
        let mut conversation = match self.backend.read(id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!("STORAGE: Cannot append to missing conversation {}", id);
                self.evict(id).await;
                return Ok(false);
            }
            Err(e) => {
                error!("STORAGE: Failed to read conversation {} before append: {}", id, e);
                self.evict(id).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        conversation.messages.push(ChatMessage {
            role,
            content: content.to_string(),
            timestamp: now,
            metadata,
        });
        conversation.updated_at = Some(now);
        let expected = conversation.messages.len();

        if let Err(e) = self.backend.write(&conversation).await {
            error!("STORAGE: Failed to persist message for conversation {}: {}", id, e);
            self.evict(id).await;
            return Err(e);
        }

        match self.backend.read(id).await {
            Ok(Some(stored)) if stored.messages.len() == expected => {
                debug!("STORAGE: Verified {} messages in conversation {}", expected, id);
                self.cache.write().await.insert(id.to_string(), conversation);
                Ok(true)
            }
            Ok(Some(stored)) => {
                error!(
                    "STORAGE: Verification mismatch for conversation {}: expected {} messages, found {}",
                    id,
                    expected,
                    stored.messages.len()
                );
                self.evict(id).await;
                Ok(false)
            }
            Ok(None) => {
                error!("STORAGE: Conversation {} vanished right after being written", id);
                self.evict(id).await;
                Ok(false)
            }
            Err(e) => {
                error!("STORAGE: Could not re-read conversation {} for verification: {}", id, e);
                self.evict(id).await;
                Ok(false)
            }
        }
    }

    /// Ordered `{role, content}` view. With a token cap, keeps the longest suffix whose
    /// characters fit in `max_tokens * 4`.
    pub async fn history(
        &self,
        id: &str,
        max_tokens: Option<usize>
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let Some(conversation) = self.load(id).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<HistoryEntry> = conversation.messages.iter().map(HistoryEntry::from).collect();

        let Some(max_tokens) = max_tokens else {
            return Ok(entries);
        };

        let total_chars: usize = entries
            .iter()
            .map(|e| e.content.chars().count())
            .sum();
        if total_chars / 4 <= max_tokens {
            return Ok(entries);
        }

        let char_budget = max_tokens.saturating_mul(4);
        let mut used = 0usize;
        let mut keep_from = entries.len();
        for (index, entry) in entries.iter().enumerate().rev() {
            let len = entry.content.chars().count();
            if used + len > char_budget {
                break;
            }
            used += len;
            keep_from = index;
        }

        debug!(
            "STORAGE: Truncated history of {} from {} to {} messages",
            id,
            entries.len(),
            entries.len() - keep_from
        );
        Ok(entries.into_iter().skip(keep_from).collect())
    }

    pub async fn summary(&self, id: &str) -> Result<Option<ConversationSummary>, StoreError> {
        Ok(self.load(id).await?.map(|c| c.summary()))
    }

    /// Summaries of every stored conversation, most recently updated first.
    /// Conversations that were never updated come last.
    pub async fn list_all(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut summaries = Vec::new();
        for id in self.backend.list_ids().await? {
            match self.peek(&id).await {
                Ok(Some(conversation)) => summaries.push(conversation.summary()),
                Ok(None) => {}
                Err(e) => warn!("STORAGE: Skipping unreadable conversation {}: {}", id, e),
            }
        }

        summaries.sort_by(|a, b| {
            match (a.updated_at, b.updated_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => b.created_at.cmp(&a.created_at),
            }
        });
        Ok(summaries)
    }

    /// Removes a conversation. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        if !is_valid_id(id) {
            return Ok(false);
        }

        let lock = self.lock_for(id).await;
        let removed = {
            let _guard = lock.lock().await;
            self.evict(id).await;
            self.backend.remove(id).await
        };
        self.release_lock(id, lock).await;
        let removed = removed?;

        if removed {
            info!("STORAGE: Deleted conversation {}", id);
        }
        Ok(removed)
    }

    /// Deletes conversations whose last activity is older than `max_age`.
    pub async fn purge_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - max_age;
        let mut purged = 0;

        for id in self.backend.list_ids().await? {
            let conversation = match self.peek(&id).await {
                Ok(Some(conversation)) => conversation,
                Ok(None) => {
                    continue;
                }
                Err(e) => {
                    warn!("STORAGE: Skipping unreadable conversation {} during purge: {}", id, e);
                    continue;
                }
            };
            if conversation.last_activity() < cutoff && self.delete(&id).await? {
                purged += 1;
            }
        }

        info!("STORAGE: Purged {} conversations older than {} days", purged, max_age.num_days());
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{ AtomicBool, Ordering };
    use tokio::sync::Notify;

    /// Wraps the memory backend and fails or silently drops writes on demand.
    struct FlakyBackend {
        inner: MemoryHistoryBackend,
        fail_writes: AtomicBool,
        drop_writes: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryHistoryBackend::new(),
                fail_writes: AtomicBool::new(false),
                drop_writes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl HistoryBackend for FlakyBackend {
        async fn read(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
            self.inner.read(id).await
        }

        async fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            if self.drop_writes.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.inner.write(conversation).await
        }

        async fn remove(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.remove(id).await
        }

        async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_ids().await
        }
    }

    /// Memory backend whose reads can be parked after taking their snapshot.
    struct GatedBackend {
        inner: MemoryHistoryBackend,
        hold_reads: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HistoryBackend for GatedBackend {
        async fn read(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
            let snapshot = self.inner.read(id).await;
            if self.hold_reads.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            snapshot
        }

        async fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
            self.inner.write(conversation).await
        }

        async fn remove(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.remove(id).await
        }

        async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_ids().await
        }
    }

    fn memory_store() -> ConversationStore {
        ConversationStore::new(Arc::new(MemoryHistoryBackend::new()))
    }

    #[tokio::test]
    async fn created_conversation_is_empty_and_loadable() {
        let store = memory_store();
        let id = store.create().await.unwrap();

        assert!(is_valid_id(&id));
        let conversation = store.load(&id).await.unwrap().unwrap();
        assert!(conversation.messages.is_empty());
        assert!(conversation.updated_at.is_none());
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_absent() {
        let store = memory_store();
        let unknown = Uuid::new_v4().to_string();

        assert!(store.load(&unknown).await.unwrap().is_none());
        assert!(store.load("../../etc/passwd").await.unwrap().is_none());
        assert!(!store.append("not-a-uuid", Role::User, "hi", None).await.unwrap());
        assert!(!store.append(&unknown, Role::User, "hi", None).await.unwrap());
    }

    #[tokio::test]
    async fn append_preserves_order_and_sets_updated_at() {
        let store = memory_store();
        let id = store.create().await.unwrap();

        assert!(store.append(&id, Role::User, "Hello", None).await.unwrap());
        assert!(store.append(&id, Role::Assistant, "Hi there", None).await.unwrap());

        let history = store.history(&id, None).await.unwrap();
        assert_eq!(
            history,
            vec![
                HistoryEntry { role: Role::User, content: "Hello".into() },
                HistoryEntry { role: Role::Assistant, content: "Hi there".into() }
            ]
        );
        let conversation = store.load(&id).await.unwrap().unwrap();
        assert!(conversation.updated_at.unwrap() >= conversation.created_at);
    }

    #[tokio::test]
    async fn history_keeps_longest_fitting_suffix() {
        let store = memory_store();
        let id = store.create().await.unwrap();
        for i in 0..4 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let content = format!("{}", i).repeat(1000);
            store.append(&id, role, &content, None).await.unwrap();
        }

        let windowed = store.history(&id, Some(300)).await.unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].content, "3".repeat(1000));

        let two = store.history(&id, Some(500)).await.unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[0].content, "2".repeat(1000));

        assert_eq!(store.history(&id, Some(1000)).await.unwrap().len(), 4);
        assert_eq!(store.load(&id).await.unwrap().unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn failed_write_evicts_cache_and_surfaces_error() {
        let backend = Arc::new(FlakyBackend::new());
        let store = ConversationStore::new(backend.clone());
        let id = store.create().await.unwrap();
        store.append(&id, Role::User, "first", None).await.unwrap();

        backend.fail_writes.store(true, Ordering::SeqCst);
        let result = store.append(&id, Role::Assistant, "lost", None).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(!store.cache.read().await.contains_key(&id));

        backend.fail_writes.store(false, Ordering::SeqCst);
        let reloaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.messages.len(), 1);
        assert_eq!(reloaded.messages[0].content, "first");
    }

    #[tokio::test]
    async fn failed_create_returns_error() {
        let backend = Arc::new(FlakyBackend::new());
        backend.fail_writes.store(true, Ordering::SeqCst);
        let store = ConversationStore::new(backend);

        assert!(store.create().await.is_err());
        assert!(store.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_conversation_are_all_kept() {
        let store = Arc::new(memory_store());
        let id = store.create().await.unwrap();

        let tasks = (0..20).map(|i| {
            let store = store.clone();
            let id = id.clone();
            async move { store.append(&id, Role::User, &format!("m{}", i), None).await.unwrap() }
        });
        let results = futures::future::join_all(tasks).await;

        assert!(results.into_iter().all(|ok| ok));
        assert_eq!(store.load(&id).await.unwrap().unwrap().messages.len(), 20);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = memory_store();
        let id = store.create().await.unwrap();

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_recent_update_with_untouched_last() {
        let store = memory_store();
        let untouched = store.create().await.unwrap();
        let older = store.create().await.unwrap();
        let newer = store.create().await.unwrap();
        store.append(&older, Role::User, "a", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(&newer, Role::User, "b", None).await.unwrap();

        let ids: Vec<String> = store
            .list_all().await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![newer, older, untouched]);
    }

    #[tokio::test]
    async fn purge_removes_only_stale_conversations() {
        let backend = Arc::new(MemoryHistoryBackend::new());
        let store = ConversationStore::new(backend.clone());

        let mut stale = Conversation::new(Uuid::new_v4().to_string());
        stale.created_at = Utc::now() - Duration::days(40);
        backend.write(&stale).await.unwrap();

        let mut touched = Conversation::new(Uuid::new_v4().to_string());
        touched.created_at = Utc::now() - Duration::days(40);
        touched.updated_at = Some(Utc::now());
        backend.write(&touched).await.unwrap();

        let fresh = store.create().await.unwrap();

        assert_eq!(store.purge_older_than(Duration::days(30)).await.unwrap(), 1);
        assert!(store.load(&stale.id).await.unwrap().is_none());
        assert!(store.load(&touched.id).await.unwrap().is_some());
        assert!(store.load(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unconfirmed_write_leaves_cache_matching_storage() {
        let backend = Arc::new(FlakyBackend::new());
        let store = ConversationStore::new(backend.clone());
        let id = store.create().await.unwrap();

        backend.drop_writes.store(true, Ordering::SeqCst);
        assert!(!store.append(&id, Role::User, "dropped", None).await.unwrap());
        assert!(!store.cache.read().await.contains_key(&id));

        assert!(store.load(&id).await.unwrap().unwrap().messages.is_empty());
        assert!(store.history(&id, None).await.unwrap().is_empty());
        assert!(backend.inner.read(&id).await.unwrap().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn slow_load_does_not_clobber_newer_append() {
        let backend = Arc::new(GatedBackend {
            inner: MemoryHistoryBackend::new(),
            hold_reads: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(ConversationStore::new(backend.clone()));
        let id = store.create().await.unwrap();
        store.evict(&id).await;

        backend.hold_reads.store(true, Ordering::SeqCst);
        let slow_load = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.load(&id).await })
        };
        backend.entered.notified().await;
        backend.hold_reads.store(false, Ordering::SeqCst);

        assert!(store.append(&id, Role::User, "B", None).await.unwrap());
        backend.release.notify_one();
        let stale = slow_load.await.unwrap().unwrap().unwrap();
        assert_eq!(stale.messages.len(), 1);

        assert!(store.append(&id, Role::Assistant, "C", None).await.unwrap());
        let durable: Vec<String> = backend.inner
            .read(&id).await
            .unwrap()
            .unwrap()
            .messages.into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(durable, vec!["B", "C"]);
        assert_eq!(store.load(&id).await.unwrap().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn lock_entries_are_released_after_use() {
        let store = Arc::new(memory_store());
        let id = store.create().await.unwrap();

        let tasks = (0..8).map(|i| {
            let store = store.clone();
            let id = id.clone();
            async move { store.append(&id, Role::User, &format!("m{}", i), None).await.unwrap() }
        });
        futures::future::join_all(tasks).await;

        assert!(store.locks.lock().await.is_empty());
        store.delete(&id).await.unwrap();
        assert!(store.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn enumeration_does_not_fill_cache() {
        let backend = Arc::new(MemoryHistoryBackend::new());
        for _ in 0..3 {
            backend.write(&Conversation::new(Uuid::new_v4().to_string())).await.unwrap();
        }
        let store = ConversationStore::new(backend);

        assert_eq!(store.list_all().await.unwrap().len(), 3);
        assert_eq!(store.purge_older_than(Duration::days(1)).await.unwrap(), 0);
        assert!(store.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn summary_reports_count_and_last_message() {
        let store = memory_store();
        let id = store.create().await.unwrap();
        store.append(&id, Role::User, "What is 2+2?", None).await.unwrap();
        store.append(&id, Role::Assistant, "4", None).await.unwrap();

        let summary = store.summary(&id).await.unwrap().unwrap();
        assert_eq!(summary.id, id);
        assert_eq!(summary.message_count, 2);
        assert!(summary.updated_at.is_some());
        let last = summary.last_message.unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "4");

        assert!(store.summary(&Uuid::new_v4().to_string()).await.unwrap().is_none());
    }
}
