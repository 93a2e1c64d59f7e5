//! Loose key/value storage for archive scratch areas

use crate::error::{Result, VolsegError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Key/value operations over `/`-separated keys
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read data from a key
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Write data to a key, replacing any previous value
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete one key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`; returns how many went away
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Every key starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of data at a key
    async fn size(&self, key: &str) -> Result<usize>;
}

/// Keys map to files below a base directory
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key, refusing anything that would leave the base directory
    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(VolsegError::InvalidInput(format!("Invalid storage key: {:?}", key)));
        }
        Ok(self.base_path.join(relative))
    }

    /// Walk the whole tree below the base directory
    async fn all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !fs::try_exists(&self.base_path).await? {
            return Ok(keys);
        }

        let mut pending = vec![self.base_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base_path) {
                    let key = relative
                        .components()
                        .filter_map(|c| c.as_os_str().to_str())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VolsegError::NotFound(format!("Key {}", key)))
            }
            Err(e) => Err(VolsegError::Io(e)),
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(key)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.full_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        fs::remove_file(&full_path).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self.all_keys().await?;
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }

    async fn size(&self, key: &str) -> Result<usize> {
        let full_path = self.full_path(key)?;
        let metadata = fs::metadata(&full_path).await?;
        Ok(metadata.len() as usize)
    }
}
