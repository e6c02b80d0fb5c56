//! In-memory connector for tests.

use std::collections::VecDeque;

use agent_sync_core::SyncError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connector::{Connector, TransportParts};

/// Server side of one in-memory connection.
pub struct ServerPeer {
    /// Credential the client presented.
    pub credential: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Result<String, SyncError>>,
}

impl ServerPeer {
    /// Push a frame to the client. Returns false once the client went away.
    pub fn send_json(&self, value: &Value) -> bool {
        self.to_client.send(Ok(value.to_string())).is_ok()
    }

    /// Push raw text, which need not be valid JSON.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(text.into())).is_ok()
    }

    /// Next frame from the client, including pings.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Next frame from the client that is not a ping.
    pub async fn recv_command(&mut self) -> Option<Value> {
        loop {
            let value = self.recv_json().await?;
            if value.get("type").and_then(Value::as_str) != Some("ping") {
                return Some(value);
            }
        }
    }

    /// Frame already queued by the client, if any.
    pub fn try_recv_json(&mut self) -> Option<Value> {
        let text = self.from_client.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Fail the transport with `err`.
    pub fn fail(self, err: SyncError) {
        let _ = self.to_client.send(Err(err));
    }

    /// Close cleanly from the server side.
    pub fn close(self) {}
}

#[derive(Default)]
struct MemoryInner {
    connects: usize,
    refusals: VecDeque<SyncError>,
}

/// Connector whose peers are handed to the test instead of a socket.
pub struct MemoryConnector {
    inner: Mutex<MemoryInner>,
    peers: mpsc::UnboundedSender<ServerPeer>,
}

impl MemoryConnector {
    /// Create a connector and the receiver yielding one `ServerPeer` per
    /// successful connect.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Mutex::new(MemoryInner::default()),
                peers,
            },
            rx,
        )
    }

    /// Make the next connect attempt fail with `err`. Queued refusals are
    /// consumed in order.
    pub fn refuse_next(&self, err: SyncError) {
        self.inner.lock().refusals.push_back(err);
    }

    /// Number of connect attempts so far, refused ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.lock().connects
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str, credential: &str) -> Result<TransportParts, SyncError> {
        {
            let mut inner = self.inner.lock();
            inner.connects += 1;
            if let Some(err) = inner.refusals.pop_front() {
                return Err(err);
            }
        }
        let (parts, from_client, to_client) = TransportParts::pair();
        let peer = ServerPeer {
            credential: credential.to_owned(),
            from_client,
            to_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| SyncError::connection("memory server gone"))?;
        Ok(parts)
    }
}
