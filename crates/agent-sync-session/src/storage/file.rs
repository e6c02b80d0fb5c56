//! Cursor storage in a JSON file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use agent_sync_core::traits::{CursorStore, SessionId, StorageError};
use async_trait::async_trait;
use tokio::sync::Mutex;

const APP_DIR: &str = "agent-sync";
const FILE_NAME: &str = "cursors.json";

/// Persists cursors as one JSON object `{sessionId: seq}`.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash mid-write leaves the previous document intact.
pub struct FileCursorStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<SessionId, u64>>>,
}

impl FileCursorStore {
    /// Store cursors at `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Store cursors under the platform data directory.
    ///
    /// # Errors
    /// Returns error if the platform has no data directory.
    pub fn in_data_dir() -> Result<Self, StorageError> {
        let base = dirs::data_dir()
            .ok_or_else(|| StorageError::Internal("no platform data directory".into()))?;
        Ok(Self::new(base.join(APP_DIR).join(FILE_NAME)))
    }

    /// Location of the cursor document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<HashMap<SessionId, u64>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, cursors: &HashMap<SessionId, u64>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(cursors)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::trace!(path = %self.path.display(), "Cursor file written");
        Ok(())
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, session_id: &str) -> Result<u64, StorageError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache
            .as_ref()
            .and_then(|c| c.get(session_id))
            .copied()
            .unwrap_or(0))
    }

    async fn advance(&self, session_id: &str, seq: u64) -> Result<bool, StorageError> {
        let mut cache = self.cache.lock().await;
        let mut cursors = match cache.take() {
            Some(cursors) => cursors,
            None => self.read_file().await?,
        };

        let current = cursors.get(session_id).copied().unwrap_or(0);
        if seq <= current {
            *cache = Some(cursors);
            return Ok(false);
        }
        cursors.insert(session_id.to_owned(), seq);
        let written = self.write_file(&cursors).await;
        if written.is_err() {
            cursors.insert(session_id.to_owned(), current);
        }
        *cache = Some(cursors);
        written.map(|()| true)
    }

    async fn clear(&self, session_id: &str) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        let mut cursors = match cache.take() {
            Some(cursors) => cursors,
            None => self.read_file().await?,
        };
        let removed = cursors.remove(session_id).is_some();
        let written = if removed {
            self.write_file(&cursors).await
        } else {
            Ok(())
        };
        *cache = Some(cursors);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cursors.json");

        let store = FileCursorStore::new(&path);
        assert_eq!(store.load("s1").await.unwrap(), 0);
        assert!(store.advance("s1", 12).await.unwrap());
        assert!(!store.advance("s1", 9).await.unwrap());
        store.advance("s2", 3).await.unwrap();

        let reopened = FileCursorStore::new(&path);
        assert_eq!(reopened.load("s1").await.unwrap(), 12);
        assert_eq!(reopened.load("s2").await.unwrap(), 3);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_clear_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("cursors.json"));
        store.advance("s1", 4).await.unwrap();
        store.clear("s1").await.unwrap();

        let reopened = FileCursorStore::new(store.path());
        assert_eq!(reopened.load("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileCursorStore::new(&path);
        assert!(matches!(
            store.load("s1").await,
            Err(StorageError::Encoding(_))
        ));
    }
}
