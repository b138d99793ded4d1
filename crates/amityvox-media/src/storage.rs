use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file too large: {0}")]
    TooLarge(String),
}

#[allow(async_fn_in_trait)]
pub trait Storage: Send + Sync {
    async fn store(&self, key: &str, data: &[u8]) -> Result<String, StorageError>;
    async fn retrieve(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl Storage for LocalStorage {
    async fn store(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        let path = self.base_path.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(key.to_string())
    }

    async fn retrieve(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.base_path.join(key);
        if !Path::new(&path).exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(fs::read(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.base_path.join(key);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

// --- File sharing storage ---

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub max_file_size: u64,
    pub p2p_threshold: u64,
    pub allowed_extensions: Option<Vec<String>>,
}

pub struct StorageManager {
    config: StorageConfig,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredFile {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub path: PathBuf,
    pub url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct P2PTransferRequest {
    pub transfer_id: String,
    pub filename: String,
    pub size: u64,
    pub sender_id: i64,
    pub recipient_ids: Vec<i64>,
    pub chunks: u64,
    pub chunk_size: u64,
}

impl StorageManager {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Store a file on the server (for files under the size limit).
    pub async fn store_file(
        &self,
        guild_id: i64,
        channel_id: i64,
        filename: &str,
        data: &[u8],
    ) -> Result<StoredFile, anyhow::Error> {
        let size = data.len() as u64;

        if size > self.config.max_file_size {
            anyhow::bail!(
                "File too large for server storage. Use P2P transfer for files over {}MB",
                self.config.max_file_size / 1_000_000
            );
        }

        let file_id = Uuid::new_v4().to_string();
        let content_type = mime_guess::from_path(filename)
            .first_or_octet_stream()
            .to_string();

        // Create directory structure: base_path/guild_id/channel_id/
        let dir = self
            .config
            .base_path
            .join(guild_id.to_string())
            .join(channel_id.to_string());
        fs::create_dir_all(&dir).await?;

        // Store with UUID filename to prevent collisions
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let stored_name = if ext.is_empty() {
            file_id.clone()
        } else {
            format!("{}.{}", file_id, ext)
        };
        let file_path = dir.join(&stored_name);

        let mut file = fs::File::create(&file_path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let url = format!(
            "/api/attachments/{}/{}",
            file_id,
            urlencoding::encode(filename)
        );

        Ok(StoredFile {
            id: file_id,
            filename: filename.to_string(),
            size,
            content_type,
            path: file_path,
            url,
        })
    }

    /// Delete a stored file.
    pub async fn delete_file(
        &self,
        guild_id: i64,
        channel_id: i64,
        file_id: &str,
    ) -> Result<(), anyhow::Error> {
        let dir = self
            .config
            .base_path
            .join(guild_id.to_string())
            .join(channel_id.to_string());

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry
                .file_name()
                .to_str()
                .map_or(false, |n| n.starts_with(file_id))
            {
                fs::remove_file(entry.path()).await?;
                return Ok(());
            }
        }

        anyhow::bail!("File not found: {}", file_id)
    }

    /// Get file path for serving.
    pub async fn get_file_path(
        &self,
        guild_id: i64,
        channel_id: i64,
        file_id: &str,
    ) -> Result<PathBuf, anyhow::Error> {
        let dir = self
            .config
            .base_path
            .join(guild_id.to_string())
            .join(channel_id.to_string());

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry
                .file_name()
                .to_str()
                .map_or(false, |n| n.starts_with(file_id))
            {
                return Ok(entry.path());
            }
        }

        anyhow::bail!("File not found: {}", file_id)
    }

    /// Create a P2P transfer request for large files.
    pub fn create_p2p_transfer(
        &self,
        filename: &str,
        size: u64,
        sender_id: i64,
        recipient_ids: Vec<i64>,
    ) -> P2PTransferRequest {
        let chunk_size: u64 = 256 * 1024; // 256KB chunks
        let chunks = (size + chunk_size - 1) / chunk_size;

        P2PTransferRequest {
            transfer_id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            size,
            sender_id,
            recipient_ids,
            chunks,
            chunk_size,
        }
    }

    /// Get storage usage for a guild.
    pub async fn get_guild_storage_usage(&self, guild_id: i64) -> Result<u64, anyhow::Error> {
        let guild_dir = self.config.base_path.join(guild_id.to_string());
        if !guild_dir.exists() {
            return Ok(0);
        }

        let mut total: u64 = 0;
        let mut stack = vec![guild_dir];

        while let Some(dir) = stack.pop() {
            if let Ok(mut entries) = fs::read_dir(&dir).await {
                while let Some(entry) = entries.next_entry().await? {
                    let metadata = entry.metadata().await?;
                    if metadata.is_file() {
                        total += metadata.len();
                    } else if metadata.is_dir() {
                        stack.push(entry.path());
                    }
                }
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &std::path::Path) -> StorageConfig {
        StorageConfig {
            base_path: base.to_path_buf(),
            max_file_size: 1024,
            p2p_threshold: 8 * 1024 * 1024,
            allowed_extensions: None,
        }
    }

    #[tokio::test]
    async fn local_storage_round_trips_bytes_through_a_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let key = storage.store("a/b/file.bin", b"hello").await.unwrap();
        assert_eq!(key, "a/b/file.bin");
        assert_eq!(storage.retrieve(&key).await.unwrap(), b"hello");

        storage.delete(&key).await.unwrap();
        assert!(matches!(storage.retrieve(&key).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn retrieving_a_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(matches!(
            storage.retrieve("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn store_file_rejects_anything_over_the_configured_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(config(dir.path()));
        let data = vec![0u8; 2048];

        let result = manager.store_file(1, 2, "big.bin", &data).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn store_file_persists_under_guild_and_channel_directories() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(config(dir.path()));

        let stored = manager.store_file(1, 2, "note.txt", b"hi").await.unwrap();
        assert_eq!(stored.filename, "note.txt");
        assert_eq!(stored.size, 2);
        assert!(stored.path.starts_with(dir.path().join("1").join("2")));
        assert!(tokio::fs::try_exists(&stored.path).await.unwrap());

        let usage = manager.get_guild_storage_usage(1).await.unwrap();
        assert_eq!(usage, 2);
    }

    #[tokio::test]
    async fn delete_file_finds_by_id_prefix_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(config(dir.path()));
        let stored = manager.store_file(1, 2, "note.txt", b"hi").await.unwrap();

        manager.delete_file(1, 2, &stored.id).await.unwrap();
        assert!(!tokio::fs::try_exists(&stored.path).await.unwrap());
    }

    #[tokio::test]
    async fn delete_file_errors_when_nothing_matches_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(config(dir.path()));
        manager.store_file(1, 2, "note.txt", b"hi").await.unwrap();

        let result = manager.delete_file(1, 2, "not-a-real-id").await;
        assert!(result.is_err());
    }

    #[test]
    fn p2p_transfer_splits_into_256kb_chunks_rounding_up() {
        let manager = StorageManager::new(StorageConfig {
            base_path: std::path::PathBuf::from("/tmp/unused"),
            max_file_size: 0,
            p2p_threshold: 0,
            allowed_extensions: None,
        });

        let request = manager.create_p2p_transfer("video.mp4", 256 * 1024 + 1, 1, vec![2, 3]);
        assert_eq!(request.chunk_size, 256 * 1024);
        assert_eq!(request.chunks, 2);
        assert_eq!(request.recipient_ids, vec![2, 3]);
    }

    #[test]
    fn p2p_transfer_of_an_exact_chunk_multiple_does_not_round_up() {
        let manager = StorageManager::new(StorageConfig {
            base_path: std::path::PathBuf::from("/tmp/unused"),
            max_file_size: 0,
            p2p_threshold: 0,
            allowed_extensions: None,
        });

        let request = manager.create_p2p_transfer("video.mp4", 256 * 1024, 1, vec![]);
        assert_eq!(request.chunks, 1);
    }
}
