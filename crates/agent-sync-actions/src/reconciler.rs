//! Merges pending-action reports from every source into one view.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use agent_sync_core::{
    ActionChange, ActionId, ActionSource, ActionStatus, ActionStore, BatchItemResult,
    BatchOutcome, Merge, PendingAction, SourceError, TrackedAction,
};
use agent_sync_transport::{ActionEvent, Envelope, Registry, Subscription};
use futures::stream::BoxStream;

/// Where a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Event delivered on a live request.
    Inline,
    /// Event pushed to subscribers.
    Broadcast,
    /// Authoritative list from the initial sync, a poll or a decision call.
    Sync,
}

/// One report about actions, independent of how it arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionUpdate {
    /// The action is pending.
    Sighted(PendingAction),
    /// The action reached `status`.
    Status { id: ActionId, status: ActionStatus },
    /// Everything the source currently considers pending.
    Snapshot(Vec<PendingAction>),
}

impl From<ActionEvent> for ActionUpdate {
    fn from(event: ActionEvent) -> Self {
        match event {
            ActionEvent::Sighted(action) => Self::Sighted(action),
            ActionEvent::Updated { id, status } => Self::Status { id, status },
            ActionEvent::InitialSync(actions) => Self::Snapshot(actions),
        }
    }
}

/// Pending-action reconciler.
///
/// Each action moves `unknown → pending → terminal → removed`. Inline events,
/// broadcasts and sync results all go through [`apply`](Self::apply), which is
/// idempotent by action id, so whichever source reports first wins and the
/// rest are no-ops. Terminal entries stay visible for a short grace period
/// and are then purged.
pub struct Reconciler {
    store: Arc<ActionStore>,
    source: Arc<dyn ActionSource>,
    grace: Duration,
}

impl Reconciler {
    /// Create a reconciler backed by `source`.
    #[must_use]
    pub fn new(source: Arc<dyn ActionSource>, grace: Duration, tombstone_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(ActionStore::new(tombstone_capacity)),
            source,
            grace,
        })
    }

    /// Merge one update. Returns how many entries changed.
    pub fn apply(self: &Arc<Self>, update: ActionUpdate, origin: Origin) -> usize {
        match update {
            ActionUpdate::Sighted(action) => usize::from(self.sight(action, origin)),
            ActionUpdate::Status { id, status } => usize::from(self.transition(&id, status, origin)),
            ActionUpdate::Snapshot(actions) => {
                let total = actions.len();
                let merged = actions
                    .into_iter()
                    .filter(|action| self.sight(action.clone(), origin))
                    .count();
                tracing::debug!(?origin, total, merged, "Merged action snapshot");
                merged
            }
        }
    }

    fn sight(&self, action: PendingAction, origin: Origin) -> bool {
        let id = action.id.clone();
        match self.store.sight(action) {
            Merge::Inserted => {
                tracing::info!(action_id = %id, ?origin, "Action pending");
                true
            }
            Merge::Ignored => {
                tracing::debug!(action_id = %id, ?origin, "Ignoring sighting of removed action");
                false
            }
            _ => false,
        }
    }

    fn transition(self: &Arc<Self>, id: &ActionId, status: ActionStatus, origin: Origin) -> bool {
        match self.store.transition(id, status) {
            Merge::Transitioned(status) => {
                tracing::info!(action_id = %id, %status, ?origin, "Action settled");
                self.schedule_purge(id.clone());
                true
            }
            Merge::Ignored => {
                tracing::debug!(action_id = %id, %status, ?origin, "Status for unknown action");
                false
            }
            _ => false,
        }
    }

    fn schedule_purge(self: &Arc<Self>, id: ActionId) {
        if self.grace.is_zero() || tokio::runtime::Handle::try_current().is_err() {
            self.store.purge(&id);
            return;
        }
        let store = Arc::downgrade(&self.store);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(store) = store.upgrade() {
                if store.purge(&id) {
                    tracing::debug!(action_id = %id, "Purged settled action");
                }
            }
        });
    }

    /// Decode and merge an action event. Returns false for other frames.
    pub fn handle_event(self: &Arc<Self>, env: &Envelope) -> bool {
        let origin = if env.request_id.is_some() {
            Origin::Inline
        } else {
            Origin::Broadcast
        };
        match ActionEvent::from_envelope(env) {
            Some(Ok(event)) => {
                self.apply(event.into(), origin);
                true
            }
            Some(Err(e)) => {
                tracing::warn!(kind = %env.kind, error = %e, "Dropping malformed action event");
                false
            }
            None => false,
        }
    }

    /// Feed every action event seen on `registry` into this reconciler.
    ///
    /// The feed is a tap, so it does not keep the connection alive on its own.
    pub fn bind(self: &Arc<Self>, registry: &Arc<Registry>) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        registry.add_tap(move |env| {
            if let Some(reconciler) = weak.upgrade() {
                reconciler.handle_event(env);
            }
        })
    }

    /// Fetch the authoritative pending list once. Returns how many were new.
    ///
    /// # Errors
    /// Returns error if the source cannot be reached.
    pub async fn initial_sync(self: &Arc<Self>) -> Result<usize, SourceError> {
        let actions = self.source.list_pending().await?;
        Ok(self.apply(ActionUpdate::Snapshot(actions), Origin::Sync))
    }

    /// Approve one action.
    ///
    /// # Errors
    /// Returns the source's error; the entry then stays pending.
    pub async fn approve(self: &Arc<Self>, id: &ActionId) -> Result<(), SourceError> {
        self.source.approve(id).await?;
        self.transition(id, ActionStatus::Approved, Origin::Sync);
        Ok(())
    }

    /// Reject one action.
    ///
    /// # Errors
    /// Returns the source's error; the entry then stays pending.
    pub async fn reject(self: &Arc<Self>, id: &ActionId, reason: Option<&str>) -> Result<(), SourceError> {
        self.source.reject(id, reason).await?;
        self.transition(id, ActionStatus::Rejected, Origin::Sync);
        Ok(())
    }

    /// Approve every currently pending action.
    pub async fn approve_all(self: &Arc<Self>) -> BatchOutcome {
        let ids = self.store.pending_ids();
        self.approve_many(&ids).await
    }

    /// Reject every currently pending action.
    pub async fn reject_all(self: &Arc<Self>, reason: Option<&str>) -> BatchOutcome {
        let ids = self.store.pending_ids();
        self.reject_many(&ids, reason).await
    }

    /// Approve the given actions, one result per id.
    pub async fn approve_many(self: &Arc<Self>, ids: &[ActionId]) -> BatchOutcome {
        if ids.is_empty() {
            return BatchOutcome::default();
        }
        let results = self.source.batch_approve(ids).await;
        self.settle_batch(ids, results, ActionStatus::Approved)
    }

    /// Reject the given actions, one result per id.
    pub async fn reject_many(self: &Arc<Self>, ids: &[ActionId], reason: Option<&str>) -> BatchOutcome {
        if ids.is_empty() {
            return BatchOutcome::default();
        }
        let results = self.source.batch_reject(ids, reason).await;
        self.settle_batch(ids, results, ActionStatus::Rejected)
    }

    /// Line results up with the requested ids and settle the ones that
    /// completed. Ids the source did not report on count as failed.
    fn settle_batch(
        self: &Arc<Self>,
        ids: &[ActionId],
        results: Result<Vec<BatchItemResult>, SourceError>,
        status: ActionStatus,
    ) -> BatchOutcome {
        let mut by_id: HashMap<ActionId, BatchItemResult> = match results {
            Ok(results) => results.into_iter().map(|r| (r.id.clone(), r)).collect(),
            Err(e) => {
                tracing::warn!(count = ids.len(), error = %e, "Batch request failed");
                ids.iter()
                    .map(|id| (id.clone(), BatchItemResult::failed(id.clone(), e.to_string())))
                    .collect()
            }
        };

        let items: Vec<BatchItemResult> = ids
            .iter()
            .map(|id| {
                by_id
                    .remove(id)
                    .unwrap_or_else(|| BatchItemResult::failed(id.clone(), "no result reported"))
            })
            .collect();

        for item in items.iter().filter(|item| item.ok) {
            self.transition(&item.id, status, Origin::Sync);
        }
        let outcome = BatchOutcome { items };
        tracing::info!(
            %status,
            succeeded = outcome.succeeded().count(),
            failed = outcome.failed().count(),
            "Batch settled"
        );
        outcome
    }

    /// Current view, in first-sighting order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackedAction> {
        self.store.snapshot()
    }

    /// Actions still awaiting a decision.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingAction> {
        self.store.pending()
    }

    /// The current view followed by every change.
    #[must_use]
    pub fn watch(&self) -> BoxStream<'static, ActionChange> {
        self.store.watch()
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FakeSource {
        pending: Mutex<Vec<PendingAction>>,
        failing: Mutex<HashSet<ActionId>>,
        down: Mutex<bool>,
        decided: Mutex<Vec<(ActionId, ActionStatus)>>,
    }

    impl FakeSource {
        fn check(&self, id: &ActionId) -> Result<(), SourceError> {
            if *self.down.lock() {
                return Err(SourceError::Unavailable("down".into()));
            }
            if self.failing.lock().contains(id) {
                return Err(SourceError::RequestFailed(format!("{id} is locked")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ActionSource for FakeSource {
        async fn list_pending(&self) -> Result<Vec<PendingAction>, SourceError> {
            if *self.down.lock() {
                return Err(SourceError::Unavailable("down".into()));
            }
            Ok(self.pending.lock().clone())
        }

        async fn approve(&self, id: &ActionId) -> Result<(), SourceError> {
            self.check(id)?;
            self.decided.lock().push((id.clone(), ActionStatus::Approved));
            Ok(())
        }

        async fn reject(&self, id: &ActionId, _reason: Option<&str>) -> Result<(), SourceError> {
            self.check(id)?;
            self.decided.lock().push((id.clone(), ActionStatus::Rejected));
            Ok(())
        }

        async fn batch_approve(
            &self,
            ids: &[ActionId],
        ) -> Result<Vec<BatchItemResult>, SourceError> {
            if *self.down.lock() {
                return Err(SourceError::Unavailable("down".into()));
            }
            Ok(ids
                .iter()
                .map(|id| match self.check(id) {
                    Ok(()) => BatchItemResult::succeeded(id.clone()),
                    Err(e) => BatchItemResult::failed(id.clone(), e.to_string()),
                })
                .collect())
        }
    }

    fn action(id: &str) -> PendingAction {
        PendingAction::new(id, "bash", format!("run {id}"))
    }

    fn reconciler(source: Arc<FakeSource>) -> Arc<Reconciler> {
        Reconciler::new(source, Duration::from_secs(1), 64)
    }

    fn pending_ids(r: &Reconciler) -> Vec<String> {
        r.pending().into_iter().map(|a| a.id.as_str().to_owned()).collect()
    }

    #[tokio::test]
    async fn test_first_source_wins_and_repeats_are_noops() {
        let r = reconciler(Arc::default());
        assert_eq!(r.apply(ActionUpdate::Sighted(action("a1")), Origin::Inline), 1);
        assert_eq!(r.apply(ActionUpdate::Sighted(action("a1")), Origin::Broadcast), 0);
        assert_eq!(
            r.apply(ActionUpdate::Snapshot(vec![action("a1"), action("a2")]), Origin::Sync),
            1
        );
        assert_eq!(pending_ids(&r), vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_duplicate_action_pending_event_yields_one_entry() {
        let r = reconciler(Arc::default());
        let env = Envelope::from_value(json!({
            "type": "action_pending",
            "action": {"id": "a1", "toolName": "bash"}
        }))
        .unwrap();
        assert!(r.handle_event(&env));
        assert!(r.handle_event(&env));
        assert_eq!(r.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_entry_is_purged_after_grace() {
        let r = reconciler(Arc::default());
        r.apply(ActionUpdate::Sighted(action("a1")), Origin::Broadcast);
        r.apply(
            ActionUpdate::Status {
                id: "a1".into(),
                status: ActionStatus::Approved,
            },
            Origin::Broadcast,
        );

        assert!(r.pending().is_empty());
        assert_eq!(r.snapshot()[0].status, ActionStatus::Approved);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(r.snapshot().len(), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(r.snapshot().is_empty());

        // A stale poll must not bring it back.
        r.apply(ActionUpdate::Snapshot(vec![action("a1")]), Origin::Sync);
        assert!(r.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_batch_partial_failure_keeps_only_failed_pending() {
        let source = Arc::new(FakeSource::default());
        source.failing.lock().insert("a2".into());
        let r = reconciler(Arc::clone(&source));
        for id in ["a1", "a2", "a3"] {
            r.apply(ActionUpdate::Sighted(action(id)), Origin::Broadcast);
        }

        let outcome = r.approve_all().await;
        let summary: Vec<(&str, bool)> = outcome
            .items
            .iter()
            .map(|i| (i.id.as_str(), i.ok))
            .collect();
        assert_eq!(summary, vec![("a1", true), ("a2", false), ("a3", true)]);
        assert!(outcome.items[1].error.is_some());
        assert!(outcome.is_partial_failure());
        assert_eq!(pending_ids(&r), vec!["a2"]);
    }

    #[tokio::test]
    async fn test_default_batch_reject_goes_item_by_item() {
        let source = Arc::new(FakeSource::default());
        source.failing.lock().insert("a1".into());
        let r = reconciler(Arc::clone(&source));
        for id in ["a1", "a2"] {
            r.apply(ActionUpdate::Sighted(action(id)), Origin::Broadcast);
        }

        let outcome = r.reject_all(Some("not now")).await;
        assert_eq!(outcome.failed().count(), 1);
        assert_eq!(pending_ids(&r), vec!["a1"]);
        assert_eq!(
            source.decided.lock().clone(),
            vec![(ActionId::from("a2"), ActionStatus::Rejected)]
        );
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_every_item() {
        let source = Arc::new(FakeSource::default());
        *source.down.lock() = true;
        let r = reconciler(Arc::clone(&source));
        r.apply(ActionUpdate::Sighted(action("a1")), Origin::Broadcast);
        r.apply(ActionUpdate::Sighted(action("a2")), Origin::Broadcast);

        let outcome = r.approve_all().await;
        assert_eq!(outcome.failed().count(), 2);
        assert_eq!(pending_ids(&r), vec!["a1", "a2"]);
        assert_eq!(r.approve_all().await.items.len(), 2);
    }

    #[tokio::test]
    async fn test_single_decisions() {
        let source = Arc::new(FakeSource::default());
        source.failing.lock().insert("locked".into());
        let r = reconciler(Arc::clone(&source));
        r.apply(ActionUpdate::Sighted(action("a1")), Origin::Broadcast);
        r.apply(ActionUpdate::Sighted(action("locked")), Origin::Broadcast);

        r.approve(&"a1".into()).await.unwrap();
        assert!(r.reject(&"locked".into(), None).await.is_err());
        assert_eq!(pending_ids(&r), vec!["locked"]);
    }

    #[tokio::test]
    async fn test_initial_sync_merges_authoritative_list() {
        let source = Arc::new(FakeSource::default());
        *source.pending.lock() = vec![action("a1"), action("a2")];
        let r = reconciler(Arc::clone(&source));
        r.apply(ActionUpdate::Sighted(action("a1")), Origin::Broadcast);

        assert_eq!(r.initial_sync().await.unwrap(), 1);
        assert_eq!(pending_ids(&r), vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let r = reconciler(Arc::default());
        let mut changes = r.watch();
        assert_eq!(changes.next().await, Some(ActionChange::Snapshot(vec![])));

        r.apply(ActionUpdate::Sighted(action("a1")), Origin::Broadcast);
        assert!(matches!(changes.next().await, Some(ActionChange::Added(_))));
    }

    #[tokio::test]
    async fn test_update_for_unknown_action_is_ignored() {
        let r = reconciler(Arc::default());
        let env = Envelope::from_value(
            json!({"type": "action_updated", "actionId": "ghost", "status": "approved"}),
        )
        .unwrap();
        assert!(r.handle_event(&env));
        assert!(r.snapshot().is_empty());
    }
}
