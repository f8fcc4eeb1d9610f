use async_trait::async_trait;
use log::{ debug, error, info };
use std::io::ErrorKind;
use std::path::{ Path, PathBuf };
use tokio::fs;
use tokio::io::AsyncWriteExt;
use crate::history::{ HistoryBackend, StoreError };
use crate::models::chat::Conversation;

const FILE_PREFIX: &str = "conversation_";
const FILE_SUFFIX: &str = ".json";

/// One pretty-printed JSON file per conversation inside a single directory.
pub struct FileHistoryBackend {
    dir: PathBuf,
}

impl FileHistoryBackend {
    /// Creates the directory if needed and checks that it accepts writes.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        if let Err(e) = fs::create_dir_all(&dir).await {
            error!("STORAGE: Failed to create storage directory {}: {}", dir.display(), e);
            return Err(e.into());
        }

        let probe = dir.join("test_write.tmp");
        fs::write(&probe, b"test").await.map_err(|e| {
            error!("STORAGE: Storage directory {} is not writable: {}", dir.display(), e);
            e
        })?;
        fs::remove_file(&probe).await?;
        info!("STORAGE: Conversation storage directory is writable: {}", dir.display());

        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, id, FILE_SUFFIX))
    }
}

#[async_trait]
impl HistoryBackend for FileHistoryBackend {
    async fn read(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let path = self.path_for(id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("STORAGE: Conversation file not found: {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e.into());
            }
        };
        let conversation: Conversation = serde_json::from_str(&text)?;
        Ok(Some(conversation))
    }

    async fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self.path_for(&conversation.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(conversation)?;

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }.await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("STORAGE: Wrote conversation file: {}", path.display());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name.strip_prefix(FILE_PREFIX).and_then(|n| n.strip_suffix(FILE_SUFFIX)) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_remove_cycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileHistoryBackend::open(temp_dir.path()).await.unwrap();

        let conversation = Conversation::new("5b0e3c1e-1111-4f4f-9a9a-000000000001".into());
        backend.write(&conversation).await.unwrap();

        let stored = backend.read(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored, conversation);
        assert_eq!(backend.list_ids().await.unwrap(), vec![conversation.id.clone()]);

        assert!(backend.remove(&conversation.id).await.unwrap());
        assert!(!backend.remove(&conversation.id).await.unwrap());
        assert!(backend.read(&conversation.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_ignores_foreign_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileHistoryBackend::open(temp_dir.path()).await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(temp_dir.path().join("conversation_abc.json.tmp"), "x").unwrap();

        assert!(backend.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_absent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileHistoryBackend::open(temp_dir.path()).await.unwrap();
        std::fs::write(temp_dir.path().join("conversation_bad.json"), "{not json").unwrap();

        assert!(matches!(backend.read("bad").await, Err(StoreError::Serde(_))));
    }
}
