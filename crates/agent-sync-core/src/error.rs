//! Error taxonomy shared by every sync component.

use std::time::Duration;

use thiserror::Error;

/// Result alias for sync operations.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors surfaced by the control connection and request correlation.
///
/// Connection-level failures reach every in-flight request; the others are
/// scoped to the request that hit them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Transport is down or went down while the request was in flight.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No terminal response arrived before the deadline.
    #[error("Request {request_id} timed out after {timeout:?}")]
    Timeout {
        /// Correlation id of the expired request.
        request_id: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A frame could not be parsed or violated the wire format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credential missing or refused. Reconnects stay suppressed until a new
    /// credential is installed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The server answered the request with an error payload.
    #[error("Remote error: {0}")]
    Remote(String),
}

impl SyncError {
    /// Shorthand for a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Shorthand for a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the caller can reasonably retry the same request.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }

    /// Whether this is an authentication failure.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
