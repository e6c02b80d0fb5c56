//! The single control connection: lifecycle, heartbeat, reconnect.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use agent_sync_core::{ConnectionState, SyncConfig, SyncError};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    connector::{Connector, TransportParts},
    correlator::RequestTable,
    fanout::Registry,
    protocol::{ClientMessage, Envelope},
};

/// Delay before reconnect attempt number `attempts` (zero-based):
/// `min(base * 2^attempts, cap)`.
#[must_use]
pub fn reconnect_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

#[derive(Default)]
struct Inner {
    credential: Option<String>,
    auth_blocked: bool,
    attempts: u32,
    /// Bumped per successful open; frames from older transports are stale.
    epoch: u64,
    /// Bumped per connect attempt; lets queued callers reuse its outcome.
    attempt_seq: u64,
    last_outcome: Option<Result<(), SyncError>>,
    last_delay: Option<Duration>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    heartbeat: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Inner {
    fn teardown(&mut self) -> bool {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        if let Some(h) = self.reader.take() {
            h.abort();
        }
        self.outbound.take().is_some()
    }
}

/// Owns the one realtime connection a client keeps to the backend.
///
/// Connects lazily on first need, sends a keepalive `ping` while open, and
/// after an unexpected close reconnects with capped exponential backoff as
/// long as someone is subscribed and a credential is available.
pub struct ConnectionManager {
    url: String,
    heartbeat_interval: Duration,
    reconnect_base: Duration,
    reconnect_cap: Duration,
    connector: Arc<dyn Connector>,
    requests: Arc<RequestTable>,
    registry: Arc<Registry>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until first use.
    #[must_use]
    pub fn new(config: &SyncConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            url: config.ws_url.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_base: config.reconnect_base(),
            reconnect_cap: config.reconnect_cap(),
            connector,
            requests: RequestTable::new(),
            registry: Registry::new(),
            inner: Mutex::new(Inner::default()),
            state_tx,
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Install or clear the credential used for the handshake.
    ///
    /// Installing one lifts an authentication block; if subscribers are
    /// waiting and no connection is up, a connect is started right away.
    pub fn set_credential(self: &Arc<Self>, credential: Option<String>) {
        let resume = {
            let mut inner = self.inner.lock();
            inner.auth_blocked = false;
            inner.credential = credential;
            inner.credential.is_some() && inner.outbound.is_none() && inner.reconnect.is_none()
        };
        if resume && self.registry.subscriber_count() > 0 {
            self.spawn_connect();
        }
    }

    /// Whether a credential is installed.
    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.inner.lock().credential.is_some()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver for connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Whether a transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().outbound.is_some()
    }

    /// Consecutive failed attempts since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// Number of transports opened so far; changes on every reconnect.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Delay of the most recently scheduled reconnect.
    #[must_use]
    pub fn last_reconnect_delay(&self) -> Option<Duration> {
        self.inner.lock().last_delay
    }

    /// In-flight request table fed by this connection.
    #[must_use]
    pub const fn requests(&self) -> &Arc<RequestTable> {
        &self.requests
    }

    /// Subscriber registry fed by this connection.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(%state, "Connection state changed");
        }
    }

    /// Return once connected, connecting first if needed.
    ///
    /// Concurrent callers share one attempt: whoever arrives while an attempt
    /// is running gets that attempt's outcome instead of starting another.
    ///
    /// # Errors
    /// `Auth` without a credential or when it is refused, `Connection` if the
    /// handshake fails.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), SyncError> {
        let seen = {
            let inner = self.inner.lock();
            if inner.outbound.is_some() {
                return Ok(());
            }
            inner.attempt_seq
        };

        let _attempt = self.connect_lock.lock().await;
        {
            let inner = self.inner.lock();
            if inner.outbound.is_some() {
                return Ok(());
            }
            if inner.attempt_seq != seen {
                if let Some(outcome) = inner.last_outcome.clone() {
                    return outcome;
                }
            }
        }
        self.connect().await
    }

    async fn connect(self: &Arc<Self>) -> Result<(), SyncError> {
        let credential = {
            let mut inner = self.inner.lock();
            inner.attempt_seq += 1;
            if let Some(pending) = inner.reconnect.take() {
                pending.abort();
            }
            if inner.auth_blocked {
                None
            } else {
                inner.credential.clone()
            }
        };

        let Some(credential) = credential else {
            let err = SyncError::Auth("no usable credential".into());
            self.on_attempt_failed(err.clone());
            return Err(err);
        };

        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.url, "Connecting control channel");
        match self.connector.connect(&self.url, &credential).await {
            Ok(parts) => {
                self.on_open(parts);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(url = %self.url, error = %err, "Control channel connect failed");
                self.on_attempt_failed(err.clone());
                Err(err)
            }
        }
    }

    fn on_open(self: &Arc<Self>, parts: TransportParts) {
        let TransportParts { sender, receiver } = parts;
        {
            let mut inner = self.inner.lock();
            inner.teardown();
            inner.epoch += 1;
            inner.attempts = 0;
            inner.last_outcome = Some(Ok(()));
            inner.heartbeat = Some(self.spawn_heartbeat(sender.clone()));
            inner.reader = Some(self.spawn_reader(inner.epoch, receiver));
            inner.outbound = Some(sender);
        }
        tracing::info!(url = %self.url, "Control channel connected");
        self.set_state(ConnectionState::Connected);
    }

    fn on_attempt_failed(self: &Arc<Self>, err: SyncError) {
        {
            let mut inner = self.inner.lock();
            inner.last_outcome = Some(Err(err.clone()));
            if err.is_auth() {
                inner.auth_blocked = true;
            }
        }
        self.set_state(ConnectionState::Error);
        if err.is_auth() {
            tracing::warn!(error = %err, "Reconnects suspended until a new credential is set");
        } else {
            self.schedule_reconnect();
        }
    }

    fn on_closed(self: &Arc<Self>, epoch: u64, reason: Option<SyncError>) {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.outbound.is_none() {
                return;
            }
            if let Some(h) = inner.heartbeat.take() {
                h.abort();
            }
            // The reader is the caller; let it finish on its own.
            inner.reader = None;
            inner.outbound = None;
        }

        let state = if reason.is_some() {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        let err = reason.unwrap_or_else(|| SyncError::connection("connection closed"));
        tracing::warn!(error = %err, "Control channel lost");
        self.set_state(state);
        self.requests.fail_all(&err);
        self.schedule_reconnect();
    }

    /// Whether a reconnect is wanted: someone is subscribed and a usable
    /// credential is installed.
    fn wants_reconnect(&self, inner: &Inner) -> bool {
        if self.registry.subscriber_count() == 0 {
            tracing::debug!("No subscribers, staying disconnected");
            return false;
        }
        inner.credential.is_some() && !inner.auth_blocked
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.reconnect.is_some() || !self.wants_reconnect(&inner) {
            return;
        }
        let delay = reconnect_delay(self.reconnect_base, self.reconnect_cap, inner.attempts);
        inner.attempts = inner.attempts.saturating_add(1);
        inner.last_delay = Some(delay);
        tracing::info!(
            attempt = inner.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );

        let weak = Arc::downgrade(self);
        inner.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else { return };
            {
                let mut inner = this.inner.lock();
                inner.reconnect = None;
                // Subscribers may have left or the credential changed while asleep.
                if !this.wants_reconnect(&inner) {
                    return;
                }
            }
            if let Err(e) = this.ensure_connected().await {
                tracing::debug!(error = %e, "Reconnect attempt failed");
            }
        }));
    }

    fn spawn_connect(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!("No runtime, deferring connect to first use");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.ensure_connected().await {
                tracing::debug!(error = %e, "Background connect failed");
            }
        });
    }

    fn spawn_heartbeat(&self, sender: mpsc::UnboundedSender<String>) -> JoinHandle<()> {
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let Ok(ping) = serde_json::to_string(&ClientMessage::Ping) else {
                return;
            };
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if sender.send(ping.clone()).is_err() {
                    break;
                }
                tracing::trace!("Heartbeat sent");
            }
        })
    }

    fn spawn_reader(
        self: &Arc<Self>,
        epoch: u64,
        mut receiver: mpsc::UnboundedReceiver<Result<String, SyncError>>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = receiver.recv().await {
                let Some(this) = weak.upgrade() else { return };
                match frame {
                    Ok(text) => this.dispatch_text(&text),
                    Err(e) => {
                        reason = Some(e);
                        break;
                    }
                }
            }
            if let Some(this) = weak.upgrade() {
                this.on_closed(epoch, reason);
            }
        })
    }

    fn dispatch_text(&self, text: &str) {
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };
        if env.is_response() {
            self.requests.resolve(&env);
            return;
        }
        if env.request_id.is_some() {
            self.requests.progress(&env);
        }
        self.registry.dispatch(&env);
    }

    /// Send a message on the open transport.
    ///
    /// # Errors
    /// `Connection` if no transport is open.
    pub fn transmit(&self, message: &ClientMessage) -> Result<(), SyncError> {
        let text = serde_json::to_string(message)?;
        let inner = self.inner.lock();
        let Some(outbound) = inner.outbound.as_ref() else {
            return Err(SyncError::connection("not connected"));
        };
        outbound
            .send(text)
            .map_err(|_| SyncError::connection("transport closed"))
    }

    /// Close the connection without reconnecting. In-flight requests fail.
    pub fn disconnect(&self) {
        let was_open = {
            let mut inner = self.inner.lock();
            if let Some(pending) = inner.reconnect.take() {
                pending.abort();
            }
            inner.attempts = 0;
            inner.teardown()
        };
        if was_open {
            tracing::info!("Control channel closed by client");
        }
        self.set_state(ConnectionState::Disconnected);
        self.requests.fail_all(&SyncError::connection("disconnected by client"));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(pending) = inner.reconnect.take() {
            pending.abort();
        }
        inner.teardown();
    }
}
