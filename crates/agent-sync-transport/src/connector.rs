//! Transport seam between the connection manager and the socket.

use agent_sync_core::SyncError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Both halves of an open transport.
///
/// Dropping `sender` closes the socket. `receiver` ends when the peer closes;
/// a transport failure is delivered as a final `Err` before it ends.
pub struct TransportParts {
    /// Outbound text frames.
    pub sender: mpsc::UnboundedSender<String>,
    /// Inbound text frames.
    pub receiver: mpsc::UnboundedReceiver<Result<String, SyncError>>,
}

impl TransportParts {
    /// Create a pair of linked channel ends: the transport parts for the
    /// client, and the peer ends for whoever plays the server.
    #[must_use]
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<Result<String, SyncError>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: out_tx,
                receiver: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens control connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`, authenticating with `credential`.
    ///
    /// # Errors
    /// `SyncError::Auth` when the credential is refused, `SyncError::Connection`
    /// for anything else.
    async fn connect(&self, url: &str, credential: &str) -> Result<TransportParts, SyncError>;
}
