//! Durable tier: one JSON document per key, aged by modification time.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;

use crate::error::CacheError;

/// A stored document and when it was last written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: Value,
    pub modified: SystemTime,
}

/// Key-value blob store with modification times.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Missing keys yield `Ok(None)`.
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError>;

    /// Replace the whole entry. Readers never observe a partial write.
    async fn store(&self, key: &str, value: &Value) -> Result<(), CacheError>;

    /// Returns `false` if the key was absent.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// All stored keys with their modification times.
    async fn list(&self) -> Result<Vec<(String, SystemTime)>, CacheError>;
}

/// Filesystem store writing `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl DurableStore for FsStore {
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = fs::metadata(&path).await?.modified()?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(StoredEntry { value, modified }))
    }

    async fn store(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(value)?;

        fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<(String, SystemTime)>, CacheError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Skip in-progress temp files
            if key.starts_with('.') {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            entries.push((key.to_string(), modified));
        }
        Ok(entries)
    }
}
