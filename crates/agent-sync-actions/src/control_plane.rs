//! One client's sync stack, wired together.

use std::sync::Arc;

use agent_sync_core::{
    ActionChange, ActionId, ActionSource, BatchOutcome, ConnectionState, CursorStore,
    PendingAction, SourceError, SyncConfig, SyncError,
};
use agent_sync_session::{MemoryCursorStore, ReplayError, ReplayTracker};
use agent_sync_transport::{
    Command, ConnectionManager, Connector, Correlator, Envelope, ProgressHandler, Subscription,
    WsConnector,
};
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;

use crate::{poller::FallbackPoller, reconciler::Reconciler};

/// Builder for [`ControlPlane`].
pub struct ControlPlaneBuilder {
    config: SyncConfig,
    source: Arc<dyn ActionSource>,
    connector: Option<Arc<dyn Connector>>,
    cursors: Option<Arc<dyn CursorStore>>,
    credential: Option<String>,
}

impl ControlPlaneBuilder {
    /// Use a custom transport instead of WebSocket.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Persist replay cursors in `store`. Defaults to memory.
    #[must_use]
    pub fn cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(store);
        self
    }

    /// Credential for the control connection handshake.
    #[must_use]
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Wire the components and start the background tasks.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> ControlPlane {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new()));
        let cursors = self
            .cursors
            .unwrap_or_else(|| Arc::new(MemoryCursorStore::new()));

        let connection = ConnectionManager::new(&self.config, connector);
        if self.credential.is_some() {
            connection.set_credential(self.credential);
        }
        let correlator = Correlator::new(Arc::clone(&connection), self.config.request_timeout());
        let replay = ReplayTracker::start(Arc::clone(&connection), cursors);
        let reconciler = Reconciler::new(
            Arc::clone(&self.source),
            self.config.display_grace(),
            self.config.tombstone_capacity,
        );
        let feed = reconciler.bind(connection.registry());
        let poller = FallbackPoller::new(
            Arc::clone(&reconciler),
            self.source,
            connection.watch_state(),
            self.config.poll_interval(),
        );
        poller.start();

        ControlPlane {
            connection,
            correlator,
            replay,
            reconciler,
            poller,
            _feed: feed,
        }
    }
}

/// Connection, correlation, replay, reconciliation and fallback polling for
/// one client.
///
/// Subscribing keeps the connection alive; with no subscribers left a dropped
/// connection stays down. Dropping the control plane closes the connection
/// and stops polling.
pub struct ControlPlane {
    connection: Arc<ConnectionManager>,
    correlator: Correlator,
    replay: Arc<ReplayTracker>,
    reconciler: Arc<Reconciler>,
    poller: Arc<FallbackPoller>,
    _feed: Subscription,
}

impl ControlPlane {
    /// Start building a control plane around an authoritative action source.
    #[must_use]
    pub fn builder(config: SyncConfig, source: Arc<dyn ActionSource>) -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            config,
            source,
            connector: None,
            cursors: None,
            credential: None,
        }
    }

    /// Subscribe to one session's events and resume it from its cursor.
    ///
    /// # Errors
    /// Returns error if the session cannot be attached; the subscription is
    /// dropped in that case.
    pub async fn subscribe_session<F>(
        &self,
        session_id: &str,
        handler: F,
    ) -> Result<Subscription, ReplayError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let subscription = self
            .connection
            .registry()
            .subscribe_session(session_id, handler);
        self.replay.attach(session_id).await?;
        Ok(subscription)
    }

    /// Subscribe to session-independent events.
    ///
    /// # Errors
    /// Returns error if the connection cannot be opened; the subscription is
    /// dropped in that case.
    pub async fn subscribe_global<F>(&self, handler: F) -> Result<Subscription, SyncError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let subscription = self.connection.registry().subscribe_global(handler);
        self.connection.ensure_connected().await?;
        Ok(subscription)
    }

    /// Stop resuming a session after reconnects.
    pub fn detach_session(&self, session_id: &str) -> bool {
        self.replay.detach(session_id)
    }

    /// Send a correlated command and wait for its payload.
    ///
    /// # Errors
    /// See [`Correlator::send`].
    pub async fn send(&self, command: Command) -> Result<Value, SyncError> {
        self.correlator.send(command).await
    }

    /// Send a correlated command, forwarding its progress events to `on_event`.
    ///
    /// # Errors
    /// See [`Correlator::send`].
    pub async fn send_with_progress(
        &self,
        command: Command,
        on_event: ProgressHandler,
    ) -> Result<Value, SyncError> {
        self.correlator.send_with_progress(command, Some(on_event)).await
    }

    /// Fetch the authoritative pending list once.
    ///
    /// # Errors
    /// Returns error if the source cannot be reached.
    pub async fn initial_sync(&self) -> Result<usize, SourceError> {
        self.reconciler.initial_sync().await
    }

    /// Approve one action.
    ///
    /// # Errors
    /// Returns the source's error.
    pub async fn approve(&self, id: &ActionId) -> Result<(), SourceError> {
        self.reconciler.approve(id).await
    }

    /// Reject one action.
    ///
    /// # Errors
    /// Returns the source's error.
    pub async fn reject(&self, id: &ActionId, reason: Option<&str>) -> Result<(), SourceError> {
        self.reconciler.reject(id, reason).await
    }

    /// Approve everything pending.
    pub async fn approve_all(&self) -> BatchOutcome {
        self.reconciler.approve_all().await
    }

    /// Reject everything pending.
    pub async fn reject_all(&self, reason: Option<&str>) -> BatchOutcome {
        self.reconciler.reject_all(reason).await
    }

    /// Actions awaiting a decision.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingAction> {
        self.reconciler.pending()
    }

    /// The action view followed by every change.
    #[must_use]
    pub fn watch_actions(&self) -> BoxStream<'static, ActionChange> {
        self.reconciler.watch()
    }

    /// Connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Install or clear the handshake credential.
    pub fn set_credential(&self, credential: Option<String>) {
        self.connection.set_credential(credential);
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    #[must_use]
    pub const fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    #[must_use]
    pub const fn replay(&self) -> &Arc<ReplayTracker> {
        &self.replay
    }

    #[must_use]
    pub const fn poller(&self) -> &Arc<FallbackPoller> {
        &self.poller
    }

    /// Stop polling and close the connection.
    pub fn shutdown(&self) {
        self.poller.stop();
        self.connection.disconnect();
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agent_sync_transport::testing::MemoryConnector;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct StaticSource {
        pending: Vec<PendingAction>,
    }

    #[async_trait]
    impl ActionSource for StaticSource {
        async fn list_pending(&self) -> Result<Vec<PendingAction>, SourceError> {
            Ok(self.pending.clone())
        }

        async fn approve(&self, _id: &ActionId) -> Result<(), SourceError> {
            Ok(())
        }

        async fn reject(&self, _id: &ActionId, _reason: Option<&str>) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn kinds() -> (
        mpsc::UnboundedReceiver<String>,
        impl Fn(&Envelope) + Send + Sync + 'static,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (rx, move |env: &Envelope| {
            let _ = tx.send(env.kind.clone());
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_tabs_see_action_and_its_removal() {
        let (connector, mut peers) = MemoryConnector::new();
        let plane = ControlPlane::builder(SyncConfig::default(), Arc::new(StaticSource::default()))
            .connector(Arc::new(connector))
            .credential("token")
            .build();

        let (mut rx1, h1) = kinds();
        let (mut rx2, h2) = kinds();
        let _tab1 = plane.subscribe_session("S", h1).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.recv_command().await.unwrap()["type"], "hello");
        let _tab2 = plane.subscribe_session("S", h2).await.unwrap();
        assert_eq!(peer.recv_command().await.unwrap()["type"], "hello");

        peer.send_json(&json!({
            "type": "action_pending",
            "sessionId": "S",
            "seq": 1,
            "action": {"id": "a1", "toolName": "bash", "description": "rm -rf build"}
        }));
        assert_eq!(rx1.recv().await.unwrap(), "action_pending");
        assert_eq!(rx2.recv().await.unwrap(), "action_pending");
        assert_eq!(plane.pending().len(), 1);

        peer.send_json(&json!({
            "type": "action_updated",
            "sessionId": "S",
            "seq": 2,
            "actionId": "a1",
            "status": "approved"
        }));
        assert_eq!(rx1.recv().await.unwrap(), "action_updated");
        assert_eq!(rx2.recv().await.unwrap(), "action_updated");
        assert!(plane.pending().is_empty());
        assert_eq!(plane.reconciler().snapshot().len(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(plane.reconciler().snapshot().is_empty());
        assert_eq!(plane.replay().cursor("S"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_only_until_connected() {
        let (connector, mut peers) = MemoryConnector::new();
        let source = StaticSource {
            pending: vec![PendingAction::new("a1", "edit", "patch main.rs")],
        };
        let plane = ControlPlane::builder(SyncConfig::default(), Arc::new(source))
            .connector(Arc::new(connector))
            .credential("token")
            .build();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(plane.poller().polls(), 1);
        assert_eq!(plane.pending().len(), 1);

        let _sub = plane.subscribe_global(|_| {}).await.unwrap();
        let _peer = peers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(plane.poller().polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_subscribe_does_not_reconnect_later() {
        let (connector, _peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        connector.refuse_next(SyncError::connection("refused"));
        let plane = ControlPlane::builder(SyncConfig::default(), Arc::new(StaticSource::default()))
            .connector(connector.clone())
            .credential("token")
            .build();

        assert!(plane.subscribe_session("S", |_| {}).await.is_err());
        assert!(plane.replay().attached().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connect_count(), 1);
        assert!(!plane.connection().is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_without_credential_fails() {
        let (connector, _peers) = MemoryConnector::new();
        let plane = ControlPlane::builder(SyncConfig::default(), Arc::new(StaticSource::default()))
            .connector(Arc::new(connector))
            .build();

        let err = plane.subscribe_global(|_| {}).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(plane.connection().registry().subscriber_count(), 0);
    }
}
