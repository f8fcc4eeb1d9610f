use async_trait::async_trait;
use crate::history::{ HistoryBackend, StoreError };
use crate::models::chat::Conversation;
use log::{ debug, error };
use redis::{ Client, AsyncCommands };
use std::collections::BTreeSet;

/// Stores each conversation as one JSON string under `<prefix><id>`.
pub struct RedisHistoryBackend {
    client: Client,
    key_prefix: String,
    scan_count: usize,
}

impl RedisHistoryBackend {
    pub fn new(host: &str, key_prefix: String, scan_count: usize) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(host)?,
            key_prefix,
            scan_count: scan_count.max(1),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

#[async_trait]
impl HistoryBackend for RedisHistoryBackend {
    async fn read(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let mut conn = self.get_connection().await?;
        let json: Option<String> = conn.get(self.key(id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(conversation)?;
        let _: () = conn.set(self.key(&conversation.id), json).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn.del(self.key(id)).await?;
        Ok(removed > 0)
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let pattern = format!("{}*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut ids = BTreeSet::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis
                ::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn).await
                .map_err(|e| {
                    error!("Error scanning history keys: {}", e);
                    e
                })?;

            collect_ids(&self.key_prefix, keys, &mut ids);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("Found {} conversation keys with prefix {}", ids.len(), self.key_prefix);
        Ok(ids.into_iter().collect())
    }
}

/// SCAN may report a key more than once; the set keeps each id once.
fn collect_ids(prefix: &str, keys: Vec<String>, ids: &mut BTreeSet<String>) {
    ids.extend(keys.into_iter().filter_map(|key| key.strip_prefix(prefix).map(str::to_string)));
}
