//! Per-session sequence cursors and the resume handshake.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use agent_sync_core::{
    SyncError,
    traits::{CursorStore, SessionId, StorageError},
};
use agent_sync_transport::{ClientMessage, ConnectionManager, Envelope, Subscription};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Replay tracker error.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

enum Persist {
    Advance { session_id: SessionId, seq: u64 },
    Flush(oneshot::Sender<()>),
}

struct Attached {
    cursor: u64,
    /// Connection epoch the last `hello` was sent on.
    announced: Option<u64>,
}

/// Tracks the highest sequence seen per session and resumes from it.
///
/// Every inbound event with a `sessionId` and `seq` raises that session's
/// cursor; the raise is persisted by a single background writer in arrival
/// order. Attached sessions re-send `hello` each time the connection comes
/// back, so the server redelivers whatever was missed.
pub struct ReplayTracker {
    connection: Arc<ConnectionManager>,
    store: Arc<dyn CursorStore>,
    attached: Mutex<HashMap<SessionId, Attached>>,
    persist_tx: mpsc::UnboundedSender<Persist>,
    tasks: Vec<JoinHandle<()>>,
    _tap: Subscription,
}

impl ReplayTracker {
    /// Start tracking on `connection`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(connection: Arc<ConnectionManager>, store: Arc<dyn CursorStore>) -> Arc<Self> {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let observer = weak.clone();
            let tap = connection.registry().add_tap(move |env: &Envelope| {
                if let (Some(tracker), Some(sid), Some(seq)) =
                    (observer.upgrade(), env.session_id.as_deref(), env.seq)
                {
                    tracker.observe(sid, seq);
                }
            });

            let writer = tokio::spawn(persist_loop(Arc::clone(&store), persist_rx));
            let resumer = tokio::spawn(resume_loop(weak.clone(), Arc::clone(&connection)));

            Self {
                connection,
                store,
                attached: Mutex::new(HashMap::new()),
                persist_tx,
                tasks: vec![writer, resumer],
                _tap: tap,
            }
        })
    }

    /// Attach a session: load its cursor and ask the server to replay every
    /// event after it. Returns the cursor sent as `sinceSeq`.
    ///
    /// Attaching an already attached session re-sends the handshake.
    ///
    /// # Errors
    /// Returns error if the cursor cannot be loaded or the connection is down.
    pub async fn attach(&self, session_id: &str) -> Result<u64, ReplayError> {
        let stored = self.store.load(session_id).await?;
        let inserted = {
            let mut attached = self.attached.lock();
            let inserted = !attached.contains_key(session_id);
            let entry = attached.entry(session_id.to_owned()).or_insert(Attached {
                cursor: 0,
                announced: None,
            });
            entry.cursor = entry.cursor.max(stored);
            entry.announced = None;
            inserted
        };

        match self.handshake(session_id).await {
            Ok(announced) => {
                let since_seq = announced
                    .or_else(|| self.cursor(session_id))
                    .unwrap_or(stored);
                tracing::info!(session_id, since_seq, "Attached session");
                Ok(since_seq)
            }
            Err(e) => {
                if inserted {
                    self.attached.lock().remove(session_id);
                }
                tracing::warn!(session_id, error = %e, "Failed to attach session");
                Err(e.into())
            }
        }
    }

    async fn handshake(&self, session_id: &str) -> Result<Option<u64>, SyncError> {
        self.connection.ensure_connected().await?;
        self.announce(session_id)
    }

    /// Stop resuming a session after reconnects. Returns whether it was attached.
    pub fn detach(&self, session_id: &str) -> bool {
        let removed = self.attached.lock().remove(session_id).is_some();
        if removed {
            tracing::debug!(session_id, "Detached session");
        }
        removed
    }

    /// Record an event's sequence. The cursor only ever moves forward.
    pub fn observe(&self, session_id: &str, seq: u64) {
        if let Some(entry) = self.attached.lock().get_mut(session_id) {
            entry.cursor = entry.cursor.max(seq);
        }
        let _ = self.persist_tx.send(Persist::Advance {
            session_id: session_id.to_owned(),
            seq,
        });
    }

    /// In-memory cursor of an attached session.
    #[must_use]
    pub fn cursor(&self, session_id: &str) -> Option<u64> {
        self.attached.lock().get(session_id).map(|a| a.cursor)
    }

    /// Attached session ids, sorted.
    #[must_use]
    pub fn attached(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.attached.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait until every observation made so far has been persisted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(Persist::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send `hello` for a session unless it was already sent on the current
    /// connection. Returns the cursor sent, or `None` if nothing was sent.
    fn announce(&self, session_id: &str) -> Result<Option<u64>, SyncError> {
        let epoch = self.connection.epoch();
        let since_seq = {
            let mut attached = self.attached.lock();
            let Some(entry) = attached.get_mut(session_id) else {
                return Ok(None);
            };
            if entry.announced == Some(epoch) {
                return Ok(None);
            }
            entry.announced = Some(epoch);
            entry.cursor
        };

        let hello = ClientMessage::Hello {
            session_id: session_id.to_owned(),
            since_seq,
        };
        if let Err(e) = self.connection.transmit(&hello) {
            if let Some(entry) = self.attached.lock().get_mut(session_id) {
                entry.announced = None;
            }
            return Err(e);
        }
        tracing::debug!(session_id, since_seq, "Sent resume handshake");
        Ok(Some(since_seq))
    }

    fn resume_all(&self) {
        for session_id in self.attached() {
            if let Err(e) = self.announce(&session_id) {
                tracing::warn!(session_id, error = %e, "Failed to resume session");
            }
        }
    }
}

impl Drop for ReplayTracker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn persist_loop(store: Arc<dyn CursorStore>, mut rx: mpsc::UnboundedReceiver<Persist>) {
    while let Some(op) = rx.recv().await {
        match op {
            Persist::Advance { session_id, seq } => match store.advance(&session_id, seq).await {
                Ok(true) => tracing::trace!(session_id, seq, "Cursor advanced"),
                Ok(false) => {}
                Err(e) => tracing::warn!(session_id, seq, error = %e, "Failed to persist cursor"),
            },
            Persist::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn resume_loop(tracker: Weak<ReplayTracker>, connection: Arc<ConnectionManager>) {
    let mut state = connection.watch_state();
    drop(connection);
    while state.changed().await.is_ok() {
        if !state.borrow_and_update().is_connected() {
            continue;
        }
        let Some(tracker) = tracker.upgrade() else { break };
        tracker.resume_all();
    }
}
