//! Core traits for cursor storage and the authoritative action source.

use async_trait::async_trait;
use thiserror::Error;

use crate::action::{ActionId, BatchItemResult, PendingAction};

/// Logical session identifier, as assigned by the backend.
pub type SessionId = String;

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable per-session sequence cursors.
///
/// Implementations only need an atomic compare-and-set-to-max; the cursor for
/// a session never moves backwards.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last acknowledged sequence for a session, `0` if never seen.
    async fn load(&self, session_id: &str) -> Result<u64, StorageError>;

    /// Raise the cursor to `seq` if it is strictly greater than the stored
    /// value. Returns whether the cursor moved.
    async fn advance(&self, session_id: &str, seq: u64) -> Result<bool, StorageError>;

    /// Forget a session's cursor.
    async fn clear(&self, session_id: &str) -> Result<(), StorageError>;
}

/// Error from the authoritative action source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Action source unavailable: {0}")]
    Unavailable(String),
    #[error("Action source rejected the credential")]
    Unauthorized,
    #[error("Action not found: {0}")]
    NotFound(ActionId),
    #[error("Action source request failed: {0}")]
    RequestFailed(String),
}

/// The backend's authoritative action ledger, reached outside the realtime
/// channel.
///
/// Used as the non-realtime code path for decisions and as the poll source
/// while the control connection is down.
#[async_trait]
pub trait ActionSource: Send + Sync {
    /// List actions currently awaiting approval.
    async fn list_pending(&self) -> Result<Vec<PendingAction>, SourceError>;

    /// Approve one action.
    async fn approve(&self, id: &ActionId) -> Result<(), SourceError>;

    /// Reject one action.
    async fn reject(&self, id: &ActionId, reason: Option<&str>) -> Result<(), SourceError>;

    /// Approve many actions, one result per input id.
    ///
    /// The default issues one `approve` per id.
    async fn batch_approve(&self, ids: &[ActionId]) -> Result<Vec<BatchItemResult>, SourceError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(match self.approve(id).await {
                Ok(()) => BatchItemResult::succeeded(id.clone()),
                Err(e) => BatchItemResult::failed(id.clone(), e.to_string()),
            });
        }
        Ok(results)
    }

    /// Reject many actions, one result per input id.
    ///
    /// The default issues one `reject` per id.
    async fn batch_reject(
        &self,
        ids: &[ActionId],
        reason: Option<&str>,
    ) -> Result<Vec<BatchItemResult>, SourceError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(match self.reject(id, reason).await {
                Ok(()) => BatchItemResult::succeeded(id.clone()),
                Err(e) => BatchItemResult::failed(id.clone(), e.to_string()),
            });
        }
        Ok(results)
    }
}
