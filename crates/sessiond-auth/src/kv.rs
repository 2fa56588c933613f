//! Key-value stores for recovery snapshots

use async_trait::async_trait;
use sessiond_error::SessionError;
use sessiond_traits::KeyValueStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

const MAX_KEY_LEN: usize = 128;

fn validate_key(key: &str) -> Result<(), SessionError> {
    if key.is_empty() {
        return Err(SessionError::validation("key", "must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(SessionError::validation(
            "key",
            format!("must be at most {MAX_KEY_LEN} bytes"),
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || key.starts_with('.')
    {
        return Err(SessionError::validation("key", "contains invalid characters"));
    }
    Ok(())
}

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FileKvStore {
    directory: PathBuf,
}

impl FileKvStore {
    /// Store files under `directory`, which is created on first write
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Directory holding the files
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SessionError> {
        validate_key(key)?;
        Ok(self.directory.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SessionError::Storage(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<(), SessionError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.directory).await?;

        // Write then rename so a crash never leaves a torn file.
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, value.as_bytes()).await.map_err(|err| {
            SessionError::Storage(format!("failed to write {}: {err}", temp.display()))
        })?;
        fs::rename(&temp, &path).await.map_err(|err| {
            SessionError::Storage(format!("failed to replace {}: {err}", path.display()))
        })?;

        tracing::trace!(key, bytes = value.len(), "Stored value");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SessionError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store, used when no directory is configured and in tests
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryKvStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// True if nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        validate_key(key)?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), SessionError> {
        validate_key(key)?;
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SessionError> {
        validate_key(key)?;
        self.data.write().await.remove(key);
        Ok(())
    }
}
