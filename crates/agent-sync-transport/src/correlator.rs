//! Request/response correlation over the control connection.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use agent_sync_core::SyncError;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    connection::ConnectionManager,
    protocol::{Command, Envelope},
};

/// Callback for non-terminal events of one request.
pub type ProgressHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

type Responder = oneshot::Sender<Result<Value, SyncError>>;

/// Correlation id: arena slot plus the slot's generation.
///
/// A reused slot gets a new generation, so a late frame for an earlier
/// occupant can never resolve the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}-{}", self.index, self.generation)
    }
}

impl FromStr for RequestId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SyncError::protocol(format!("malformed request id {s:?}"));
        let rest = s.strip_prefix("req-").ok_or_else(bad)?;
        let (index, generation) = rest.split_once('-').ok_or_else(bad)?;
        Ok(Self {
            index: index.parse().map_err(|_| bad())?,
            generation: generation.parse().map_err(|_| bad())?,
        })
    }
}

struct Slot {
    generation: u32,
    responder: Responder,
    on_event: Option<ProgressHandler>,
}

enum Entry {
    Occupied(Slot),
    Vacant { generation: u32, next_free: Option<u32> },
}

#[derive(Default)]
struct Arena {
    entries: Vec<Entry>,
    free_head: Option<u32>,
    len: usize,
}

impl Arena {
    fn insert(&mut self, responder: Responder, on_event: Option<ProgressHandler>) -> RequestId {
        self.len += 1;
        if let Some(index) = self.free_head {
            let entry = &mut self.entries[index as usize];
            if let Entry::Vacant {
                generation,
                next_free,
            } = *entry
            {
                self.free_head = next_free;
                *entry = Entry::Occupied(Slot {
                    generation,
                    responder,
                    on_event,
                });
                return RequestId { index, generation };
            }
        }
        let index = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.entries.push(Entry::Occupied(Slot {
            generation: 0,
            responder,
            on_event,
        }));
        RequestId {
            index,
            generation: 0,
        }
    }

    fn get(&self, id: RequestId) -> Option<&Slot> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied(slot) if slot.generation == id.generation => Some(slot),
            _ => None,
        }
    }

    fn remove(&mut self, id: RequestId) -> Option<Slot> {
        let entry = self.entries.get_mut(id.index as usize)?;
        match entry {
            Entry::Occupied(slot) if slot.generation == id.generation => {}
            _ => return None,
        }
        let vacant = Entry::Vacant {
            generation: id.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Entry::Occupied(slot) = std::mem::replace(entry, vacant) else {
            return None;
        };
        self.free_head = Some(id.index);
        self.len -= 1;
        Some(slot)
    }

    fn drain(&mut self) -> Vec<Slot> {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied(slot) => Some(RequestId {
                    index: u32::try_from(index).ok()?,
                    generation: slot.generation,
                }),
                Entry::Vacant { .. } => None,
            })
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// In-flight request table.
///
/// Each entry is resolved exactly once: whichever path removes it (terminal
/// response, deadline, connection loss, caller drop) is the one that resolves
/// it. Removal happens under the lock; the responder fires after.
#[derive(Default)]
pub struct RequestTable {
    arena: Mutex<Arena>,
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, responder: Responder, on_event: Option<ProgressHandler>) -> RequestId {
        self.arena.lock().insert(responder, on_event)
    }

    fn remove(&self, id: RequestId) -> bool {
        self.arena.lock().remove(id).is_some()
    }

    /// Resolve the request a `response` frame answers. Returns false for
    /// unknown, malformed or already-resolved ids.
    pub fn resolve(&self, env: &Envelope) -> bool {
        let Some(id) = env.request_id.as_deref().and_then(|s| s.parse::<RequestId>().ok()) else {
            tracing::debug!(request_id = ?env.request_id, "Response for unknown request");
            return false;
        };
        let Some(slot) = self.arena.lock().remove(id) else {
            tracing::debug!(%id, "Response for settled request");
            return false;
        };
        let _ = slot.responder.send(env.response_outcome());
        true
    }

    /// Forward a non-terminal event to the request's progress handler.
    /// Returns false if the request is not in flight.
    pub fn progress(&self, env: &Envelope) -> bool {
        let Some(id) = env.request_id.as_deref().and_then(|s| s.parse::<RequestId>().ok()) else {
            return false;
        };
        let handler = match self.arena.lock().get(id) {
            Some(slot) => slot.on_event.clone(),
            None => return false,
        };
        if let Some(handler) = handler {
            handler(env);
        }
        true
    }

    /// Reject every in-flight request with `err`. Returns how many there were.
    pub fn fail_all(&self, err: &SyncError) -> usize {
        let slots = self.arena.lock().drain();
        let count = slots.len();
        for slot in slots {
            let _ = slot.responder.send(Err(err.clone()));
        }
        if count > 0 {
            tracing::debug!(count, error = %err, "Failed in-flight requests");
        }
        count
    }

    /// Number of requests awaiting a terminal response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.arena.lock().len
    }
}

/// Frees the slot if the caller stops waiting before the request settles.
struct CancelGuard<'a> {
    table: &'a RequestTable,
    id: RequestId,
    armed: bool,
}

impl CancelGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.table.remove(self.id) {
            tracing::trace!(id = %self.id, "Released abandoned request");
        }
    }
}

/// Sends correlated commands and awaits their terminal response.
#[derive(Clone)]
pub struct Correlator {
    connection: Arc<ConnectionManager>,
    table: Arc<RequestTable>,
    timeout: Duration,
}

impl Correlator {
    /// Create a correlator on `connection` with a per-request deadline.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, timeout: Duration) -> Self {
        let table = Arc::clone(connection.requests());
        Self {
            connection,
            table,
            timeout,
        }
    }

    /// Override the deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a command and wait for its terminal response payload.
    ///
    /// # Errors
    /// `Connection` if the transport is down or drops, `Timeout` past the
    /// deadline, `Remote` if the server answers with an error.
    pub async fn send(&self, command: Command) -> Result<Value, SyncError> {
        self.send_with_progress(command, None).await
    }

    /// Like [`send`](Self::send), also delivering non-terminal events tagged
    /// with the request id to `on_event`.
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_with_progress(
        &self,
        command: Command,
        on_event: Option<ProgressHandler>,
    ) -> Result<Value, SyncError> {
        self.connection.ensure_connected().await?;

        let (tx, mut rx) = oneshot::channel();
        let id = self.table.insert(tx, on_event);
        let mut guard = CancelGuard {
            table: &self.table,
            id,
            armed: true,
        };
        let kind = command.kind;
        tracing::debug!(%id, ?kind, "Sending request");

        // On failure the guard frees the slot.
        self.connection.transmit(&command.into_message(id.to_string()))?;

        let result = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(received) => received,
            Err(_elapsed) => {
                if self.table.remove(id) {
                    guard.disarm();
                    tracing::warn!(%id, timeout = ?self.timeout, "Request timed out");
                    return Err(SyncError::Timeout {
                        request_id: id.to_string(),
                        timeout: self.timeout,
                    });
                }
                // Settled concurrently with the deadline; its value is on the way.
                rx.await
            }
        };
        guard.disarm();
        result.unwrap_or_else(|_| Err(SyncError::connection("request abandoned")))
    }

    /// The shared in-flight table.
    #[must_use]
    pub fn table(&self) -> &Arc<RequestTable> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use agent_sync_core::SyncConfig;
    use serde_json::json;

    use super::*;
    use crate::testing::{MemoryConnector, ServerPeer};

    async fn connected(timeout: Duration) -> (Correlator, ServerPeer) {
        let (connector, mut peers) = MemoryConnector::new();
        let conn = ConnectionManager::new(&SyncConfig::default(), Arc::new(connector));
        conn.set_credential(Some("token".into()));
        conn.ensure_connected().await.unwrap();
        let peer = peers.recv().await.unwrap();
        (Correlator::new(conn, timeout), peer)
    }

    fn response(id: RequestId, body: Value) -> Envelope {
        let mut frame = json!({"type": "response", "requestId": id.to_string()});
        if let (Some(obj), Value::Object(extra)) = (frame.as_object_mut(), body) {
            obj.extend(extra);
        }
        Envelope::from_value(frame).unwrap()
    }

    #[test]
    fn test_request_id_round_trips_through_text() {
        let id = RequestId {
            index: 3,
            generation: 9,
        };
        assert_eq!(id.to_string(), "req-3-9");
        assert_eq!("req-3-9".parse::<RequestId>().unwrap(), id);
        assert!("req-3".parse::<RequestId>().is_err());
        assert!("job-1-1".parse::<RequestId>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_settles_exactly_once() {
        let table = RequestTable::new();
        let (tx, rx) = oneshot::channel();
        let id = table.insert(tx, None);

        assert!(table.resolve(&response(id, json!({"payload": 1}))));
        assert!(!table.resolve(&response(id, json!({"payload": 2}))));
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reused_slot_rejects_stale_id() {
        let table = RequestTable::new();
        let (tx, _rx) = oneshot::channel();
        let first = table.insert(tx, None);
        assert!(table.remove(first));

        let (tx, mut rx) = oneshot::channel();
        let second = table.insert(tx, None);
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);

        assert!(!table.resolve(&response(first, json!({"payload": "late"}))));
        assert!(rx.try_recv().is_err());
        assert_eq!(table.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything() {
        let table = RequestTable::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            table.insert(tx, None);
            receivers.push(rx);
        }

        assert_eq!(table.fail_all(&SyncError::connection("gone")), 3);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(SyncError::connection("gone")));
        }
        assert_eq!(table.in_flight(), 0);
        assert_eq!(table.fail_all(&SyncError::connection("again")), 0);
    }

    #[test]
    fn test_progress_reaches_handler_without_settling() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let table = RequestTable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        let (tx, _rx) = oneshot::channel();
        let id = table.insert(
            tx,
            Some(Arc::new(move |_: &Envelope| {
                seen_in.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let chunk = Envelope::from_value(json!({"type": "chunk", "requestId": id.to_string()}))
            .unwrap();
        assert!(table.progress(&chunk));
        assert!(table.progress(&chunk));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_error_response_is_remote_error() {
        let table = RequestTable::new();
        let (tx, mut rx) = oneshot::channel();
        let id = table.insert(tx, None);

        table.resolve(&response(id, json!({"error": "no such tool"})));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(SyncError::Remote("no such tool".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_responses_and_timeout_are_independent() {
        let (correlator, mut peer) = connected(Duration::from_secs(5)).await;

        let server = async {
            let mut commands = Vec::new();
            for _ in 0..3 {
                commands.push(peer.recv_command().await.unwrap());
            }
            // Answer the third before the first; never answer the second.
            for n in [3, 1] {
                let cmd = commands.iter().find(|c| c["n"] == n).unwrap();
                peer.send_json(&json!({
                    "type": "response",
                    "requestId": cmd["requestId"],
                    "payload": n
                }));
            }
            commands
        };
        let (commands, r1, r2, r3) = tokio::join!(
            server,
            correlator.send(Command::request(json!({"n": 1}))),
            correlator.send(Command::request(json!({"n": 2}))),
            correlator.send(Command::request(json!({"n": 3}))),
        );

        assert_eq!(r1, Ok(json!(1)));
        assert_eq!(r3, Ok(json!(3)));
        let second = commands.iter().find(|c| c["n"] == 2).unwrap();
        assert_eq!(
            r2,
            Err(SyncError::Timeout {
                request_id: second["requestId"].as_str().unwrap().to_owned(),
                timeout: Duration::from_secs(5),
            })
        );
        assert_eq!(correlator.table().in_flight(), 0);

        // A response after the deadline finds no slot.
        let late = Envelope::from_value(json!({
            "type": "response",
            "requestId": second["requestId"],
            "payload": 2
        }))
        .unwrap();
        assert!(!correlator.table().resolve(&late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_send_frees_its_slot() {
        let (correlator, mut peer) = connected(Duration::from_secs(30)).await;

        let mut send = Box::pin(correlator.send(Command::request(json!({"op": "slow"}))));
        tokio::select! {
            _ = &mut send => panic!("request settled without a response"),
            cmd = peer.recv_command() => assert_eq!(cmd.unwrap()["op"], "slow"),
        }
        assert_eq!(correlator.table().in_flight(), 1);

        drop(send);
        assert_eq!(correlator.table().in_flight(), 0);
    }
}
