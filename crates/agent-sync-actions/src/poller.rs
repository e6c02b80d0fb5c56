//! Polls the action source while the control connection is down.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use agent_sync_core::{ActionSource, ConnectionState, SourceError};
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::reconciler::{ActionUpdate, Origin, Reconciler};

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The poll ran; this many actions were new.
    Merged(usize),
    /// Another poll was still running.
    Skipped,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fallback poller.
///
/// While the connection is anything but `Connected`, lists pending actions on
/// a fixed interval and merges them through the reconciler. Stops as soon as
/// the connection comes back and starts again when it drops.
pub struct FallbackPoller {
    reconciler: Arc<Reconciler>,
    source: Arc<dyn ActionSource>,
    state: watch::Receiver<ConnectionState>,
    interval: Duration,
    busy: AtomicBool,
    polls: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackPoller {
    #[must_use]
    pub fn new(
        reconciler: Arc<Reconciler>,
        source: Arc<dyn ActionSource>,
        state: watch::Receiver<ConnectionState>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            source,
            state,
            interval,
            busy: AtomicBool::new(false),
            polls: AtomicU64::new(0),
            task: Mutex::new(None),
        })
    }

    /// Poll once, unless a poll is already running.
    ///
    /// # Errors
    /// Returns the source's error; nothing is merged.
    pub async fn poll_once(&self) -> Result<PollOutcome, SourceError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("Previous poll still running, skipping tick");
            return Ok(PollOutcome::Skipped);
        }
        let _busy = BusyGuard(&self.busy);

        let result = self.source.list_pending().await;
        self.polls.fetch_add(1, Ordering::Relaxed);
        let actions = result.inspect_err(|e| tracing::warn!(error = %e, "Fallback poll failed"))?;
        let merged = self
            .reconciler
            .apply(ActionUpdate::Snapshot(actions), Origin::Sync);
        tracing::debug!(merged, "Fallback poll merged");
        Ok(PollOutcome::Merged(merged))
    }

    /// Number of polls that ran to completion, failed ones included.
    #[must_use]
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Whether a poll is running right now.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start the background loop. Calling it again restarts the loop.
    pub fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(Arc::clone(self).run());
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut state = self.state.clone();
        loop {
            // Idle while connected.
            while state.borrow_and_update().is_connected() {
                if state.changed().await.is_err() {
                    return;
                }
            }

            tracing::info!(interval = ?self.interval, "Control channel down, polling for actions");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _ = this.poll_once().await;
                        });
                    }
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if state.borrow_and_update().is_connected() {
                            tracing::info!("Control channel back, polling stopped");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_sync_core::{ActionId, PendingAction};
    use async_trait::async_trait;

    use super::*;

    struct SlowSource {
        delay: Duration,
        calls: AtomicU64,
        in_flight: AtomicU64,
        max_in_flight: AtomicU64,
    }

    impl SlowSource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                max_in_flight: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl ActionSource for SlowSource {
        async fn list_pending(&self) -> Result<Vec<PendingAction>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![PendingAction::new(format!("a{n}"), "bash", "")])
        }

        async fn approve(&self, _id: &ActionId) -> Result<(), SourceError> {
            Ok(())
        }

        async fn reject(&self, _id: &ActionId, _reason: Option<&str>) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn poller(
        source: &Arc<SlowSource>,
        initial: ConnectionState,
    ) -> (Arc<FallbackPoller>, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(initial);
        let reconciler = Reconciler::new(source.clone(), Duration::from_secs(1), 16);
        let poller = FallbackPoller::new(reconciler, source.clone(), rx, Duration::from_secs(5));
        (poller, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_while_disconnected() {
        let source = SlowSource::new(Duration::from_millis(10));
        let (poller, _tx) = poller(&source, ConnectionState::Disconnected);
        poller.start();

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(poller.polls(), 3);
        assert_eq!(poller.reconciler.pending().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_while_connected_and_stops_on_reconnect() {
        let source = SlowSource::new(Duration::from_millis(10));
        let (poller, tx) = poller(&source, ConnectionState::Connected);
        poller.start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(poller.polls(), 0);

        tx.send_replace(ConnectionState::Error);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(poller.polls(), 2);

        tx.send_replace(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(poller.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_overlaps_a_slow_poll() {
        let source = SlowSource::new(Duration::from_secs(12));
        let (poller, _tx) = poller(&source, ConnectionState::Disconnected);
        poller.start();

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        // Polls start at 0s, 15s and 30s; the ticks in between find the
        // previous poll still running.
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_poll_once_is_skipped() {
        let source = SlowSource::new(Duration::from_millis(50));
        let (poller, _tx) = poller(&source, ConnectionState::Disconnected);

        let (a, b) = tokio::join!(poller.poll_once(), poller.poll_once());
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&PollOutcome::Merged(1)));
        assert!(outcomes.contains(&PollOutcome::Skipped));
        assert!(!poller.is_polling());
    }
}
