//! Identity-keyed, insertion-ordered action view with change broadcast.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::action::{ActionId, ActionStatus, PendingAction, TrackedAction};

/// Live listener buffer; a lagging listener gets a fresh snapshot instead.
const CHANGE_BUFFER: usize = 1024;

/// A change to the view, as seen by watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionChange {
    /// Full view, sent first and after a listener fell behind.
    Snapshot(Vec<TrackedAction>),
    /// A new action entered the view.
    Added(TrackedAction),
    /// An action reached a terminal status.
    StatusChanged {
        id: ActionId,
        status: ActionStatus,
    },
    /// An action left the view.
    Removed(ActionId),
}

/// What a merge did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// First sighting; the action is now pending.
    Inserted,
    /// Pending → terminal.
    Transitioned(ActionStatus),
    /// Already known in an equal or later state.
    Unchanged,
    /// Unknown or recently removed id; nothing to do.
    Ignored,
}

struct Inner {
    entries: IndexMap<ActionId, TrackedAction>,
    tombstones: VecDeque<ActionId>,
    tombstone_set: HashSet<ActionId>,
}

impl Inner {
    fn bury(&mut self, id: ActionId, capacity: usize) {
        if capacity == 0 || !self.tombstone_set.insert(id.clone()) {
            return;
        }
        self.tombstones.push_back(id);
        while self.tombstones.len() > capacity {
            if let Some(old) = self.tombstones.pop_front() {
                self.tombstone_set.remove(&old);
            }
        }
    }
}

/// The reconciled set of actions.
///
/// All mutation goes through the merge operations below, which are
/// idempotent by identity: repeating a sighting or a status change leaves the
/// view as it was. Entries keep their first-sighting order.
pub struct ActionStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ActionChange>,
    tombstone_capacity: usize,
}

impl Default for ActionStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ActionStore {
    /// Create an empty store remembering up to `tombstone_capacity` removed ids.
    #[must_use]
    pub fn new(tombstone_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: RwLock::new(Inner {
                entries: IndexMap::new(),
                tombstones: VecDeque::new(),
                tombstone_set: HashSet::new(),
            }),
            sender,
            tombstone_capacity,
        }
    }

    /// Record a sighting of an action reported as pending.
    ///
    /// The first sighting wins: later sightings never overwrite the stored
    /// description or preview.
    pub fn sight(&self, action: PendingAction) -> Merge {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&action.id) {
            return Merge::Unchanged;
        }
        if inner.tombstone_set.contains(&action.id) {
            return Merge::Ignored;
        }
        let tracked = TrackedAction {
            action,
            status: ActionStatus::Pending,
        };
        inner
            .entries
            .insert(tracked.action.id.clone(), tracked.clone());
        let _ = self.sender.send(ActionChange::Added(tracked));
        Merge::Inserted
    }

    /// Apply a status report.
    ///
    /// Only `pending → terminal` changes anything. A terminal entry never
    /// returns to pending, and a status for an unknown id is ignored.
    pub fn transition(&self, id: &ActionId, status: ActionStatus) -> Merge {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(id) else {
            return Merge::Ignored;
        };
        if entry.status.is_terminal() || !status.is_terminal() {
            return Merge::Unchanged;
        }
        entry.status = status;
        let _ = self.sender.send(ActionChange::StatusChanged {
            id: id.clone(),
            status,
        });
        Merge::Transitioned(status)
    }

    /// Remove a terminal entry. Pending entries are never removed.
    pub fn purge(&self, id: &ActionId) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.get(id) {
            Some(entry) if entry.status.is_terminal() => {}
            _ => return false,
        }
        inner.entries.shift_remove(id);
        inner.bury(id.clone(), self.tombstone_capacity);
        let _ = self.sender.send(ActionChange::Removed(id.clone()));
        true
    }

    /// Look up one entry.
    #[must_use]
    pub fn get(&self, id: &ActionId) -> Option<TrackedAction> {
        self.inner.read().entries.get(id).cloned()
    }

    /// Whether the id is in the view (pending or in its grace period).
    #[must_use]
    pub fn contains(&self, id: &ActionId) -> bool {
        self.inner.read().entries.contains_key(id)
    }

    /// Copy of the whole view in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackedAction> {
        self.inner.read().entries.values().cloned().collect()
    }

    /// Actions still awaiting a decision, in insertion order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingAction> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|t| t.status == ActionStatus::Pending)
            .map(|t| t.action.clone())
            .collect()
    }

    /// Ids of actions still awaiting a decision.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<ActionId> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|t| t.status == ActionStatus::Pending)
            .map(|t| t.action.id.clone())
            .collect()
    }

    /// Number of entries in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Get a receiver for live changes.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<ActionChange> {
        self.sender.subscribe()
    }

    /// Stream that yields the current view, then every later change.
    ///
    /// The snapshot and the subscription are taken under one lock, so no
    /// change falls between them. A listener that lags behind the buffer is
    /// resynchronised with a fresh snapshot.
    #[must_use]
    pub fn watch(self: &Arc<Self>) -> futures::stream::BoxStream<'static, ActionChange> {
        let (snapshot, rx): (Vec<TrackedAction>, _) = {
            let inner = self.inner.read();
            let rx = self.sender.subscribe();
            (inner.entries.values().cloned().collect(), rx)
        };

        let store = Arc::clone(self);
        let live = BroadcastStream::new(rx).map(move |res| match res {
            Ok(change) => change,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Action watcher lagged, resending snapshot");
                ActionChange::Snapshot(store.snapshot())
            }
        });

        futures::stream::once(async move { ActionChange::Snapshot(snapshot) })
            .chain(live)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str) -> PendingAction {
        PendingAction::new(id, "bash", format!("run {id}"))
    }

    #[test]
    fn test_repeated_sighting_is_idempotent() {
        let store = ActionStore::default();
        assert_eq!(store.sight(action("a1")), Merge::Inserted);
        assert_eq!(store.sight(action("a1")), Merge::Unchanged);
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_ids(), vec![ActionId::from("a1")]);
    }

    #[test]
    fn test_first_sighting_wins() {
        let store = ActionStore::default();
        store.sight(action("a1"));
        store.sight(PendingAction::new("a1", "bash", "other").with_preview("diff"));

        let entry = store.get(&"a1".into()).unwrap();
        assert_eq!(entry.action.description, "run a1");
        assert!(entry.action.preview.is_none());
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let store = ActionStore::default();
        for id in ["c", "a", "b"] {
            store.sight(action(id));
        }
        let order: Vec<_> = store.snapshot().into_iter().map(|t| t.action.id).collect();
        let expected: Vec<ActionId> = vec!["c".into(), "a".into(), "b".into()];
        assert_eq!(order, expected);
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let store = ActionStore::default();
        store.sight(action("a1"));
        let id = ActionId::from("a1");

        assert_eq!(
            store.transition(&id, ActionStatus::Approved),
            Merge::Transitioned(ActionStatus::Approved)
        );
        assert_eq!(store.transition(&id, ActionStatus::Pending), Merge::Unchanged);
        assert_eq!(store.transition(&id, ActionStatus::Rejected), Merge::Unchanged);
        assert_eq!(store.get(&id).unwrap().status, ActionStatus::Approved);
        assert!(store.pending().is_empty());
    }

    #[test]
    fn test_status_for_unknown_id_is_ignored() {
        let store = ActionStore::default();
        assert_eq!(
            store.transition(&"ghost".into(), ActionStatus::Approved),
            Merge::Ignored
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_only_removes_terminal_entries() {
        let store = ActionStore::default();
        store.sight(action("a1"));
        let id = ActionId::from("a1");

        assert!(!store.purge(&id));
        store.transition(&id, ActionStatus::Rejected);
        assert!(store.purge(&id));
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_tombstone_blocks_resurrection() {
        let store = ActionStore::new(1);
        for id in ["a1", "a2"] {
            store.sight(action(id));
            store.transition(&id.into(), ActionStatus::Approved);
            store.purge(&id.into());
        }

        // a2 is remembered, a1 fell out of the bounded tombstone list.
        assert_eq!(store.sight(action("a2")), Merge::Ignored);
        assert_eq!(store.sight(action("a1")), Merge::Inserted);
    }

    #[tokio::test]
    async fn test_watch_starts_with_snapshot() {
        let store = Arc::new(ActionStore::default());
        store.sight(action("a1"));

        let mut stream = store.watch();
        match stream.next().await.unwrap() {
            ActionChange::Snapshot(view) => assert_eq!(view.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }

        store.sight(action("a2"));
        match stream.next().await.unwrap() {
            ActionChange::Added(t) => assert_eq!(t.action.id.as_str(), "a2"),
            other => panic!("expected added, got {other:?}"),
        }
    }
}
