//! In-memory cursor storage.

use std::{collections::HashMap, sync::RwLock};

use agent_sync_core::traits::{CursorStore, SessionId, StorageError};
use async_trait::async_trait;

/// In-memory cursor store.
///
/// Useful for tests and short-lived clients. Cursors are lost on restart, so
/// the next attach replays the session from the beginning.
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<SessionId, u64>>,
}

impl MemoryCursorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store pre-seeded with cursors.
    #[must_use]
    pub fn with_cursors(cursors: impl IntoIterator<Item = (SessionId, u64)>) -> Self {
        Self {
            cursors: RwLock::new(cursors.into_iter().collect()),
        }
    }
}

impl Default for MemoryCursorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, session_id: &str) -> Result<u64, StorageError> {
        Ok(self
            .cursors
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(session_id)
            .copied()
            .unwrap_or(0))
    }

    async fn advance(&self, session_id: &str, seq: u64) -> Result<bool, StorageError> {
        let mut cursors = self
            .cursors
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let cursor = cursors.entry(session_id.to_owned()).or_insert(0);
        if seq <= *cursor {
            return Ok(false);
        }
        *cursor = seq;
        Ok(true)
    }

    async fn clear(&self, session_id: &str) -> Result<(), StorageError> {
        self.cursors
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load("s1").await.unwrap(), 0);

        assert!(store.advance("s1", 5).await.unwrap());
        assert!(!store.advance("s1", 3).await.unwrap());
        assert!(!store.advance("s1", 5).await.unwrap());
        assert_eq!(store.load("s1").await.unwrap(), 5);

        store.clear("s1").await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), 0);
    }

    #[test]
    fn test_sessions_are_independent() {
        let store = MemoryCursorStore::with_cursors([("s1".to_owned(), 7)]);
        tokio_test::assert_ok!(tokio_test::block_on(store.advance("s2", 2)));
        assert_eq!(tokio_test::block_on(store.load("s1")).unwrap(), 7);
        assert_eq!(tokio_test::block_on(store.load("s2")).unwrap(), 2);
    }
}
