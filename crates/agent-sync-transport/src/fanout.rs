//! Routing of inbound events to session and global subscribers.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::protocol::Envelope;

/// Callback invoked for each routed envelope.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Global,
    Session(String),
    Tap,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    global: Vec<(u64, Handler)>,
    sessions: HashMap<String, Vec<(u64, Handler)>>,
    taps: Vec<(u64, Handler)>,
}

/// Subscriber registry keyed by session id.
///
/// Envelopes carrying a `sessionId` reach only that session's subscribers;
/// envelopes without one reach only global subscribers. Taps see every
/// envelope but are not subscribers: they never keep the connection alive.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(self: &Arc<Self>, scope: Scope, handler: Handler) -> Subscription {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            match &scope {
                Scope::Global => inner.global.push((id, handler)),
                Scope::Session(sid) => inner
                    .sessions
                    .entry(sid.clone())
                    .or_default()
                    .push((id, handler)),
                Scope::Tap => inner.taps.push((id, handler)),
            }
            id
        };
        tracing::trace!(?scope, id, "Subscriber added");
        Subscription {
            registry: Arc::downgrade(self),
            scope,
            id,
            active: true,
        }
    }

    /// Receive every envelope scoped to `session_id`.
    pub fn subscribe_session<F>(self: &Arc<Self>, session_id: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add(Scope::Session(session_id.into()), Arc::new(handler))
    }

    /// Receive every envelope that has no session scope.
    pub fn subscribe_global<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add(Scope::Global, Arc::new(handler))
    }

    /// Observe every envelope without counting as a subscriber.
    pub fn add_tap<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add(Scope::Tap, Arc::new(handler))
    }

    fn remove(&self, scope: &Scope, id: u64) {
        let mut inner = self.inner.lock();
        match scope {
            Scope::Global => inner.global.retain(|(i, _)| *i != id),
            Scope::Tap => inner.taps.retain(|(i, _)| *i != id),
            Scope::Session(sid) => {
                if let Some(list) = inner.sessions.get_mut(sid) {
                    list.retain(|(i, _)| *i != id);
                    if list.is_empty() {
                        inner.sessions.remove(sid);
                    }
                }
            }
        }
    }

    /// Deliver an envelope. Returns how many subscribers (taps excluded) saw it.
    ///
    /// Handlers run after the registry lock is released, so a handler may
    /// subscribe or unsubscribe without deadlocking.
    pub fn dispatch(&self, env: &Envelope) -> usize {
        let (taps, targets): (Vec<Handler>, Vec<Handler>) = {
            let inner = self.inner.lock();
            let taps = inner.taps.iter().map(|(_, h)| Arc::clone(h)).collect();
            let targets = match &env.session_id {
                Some(sid) => inner
                    .sessions
                    .get(sid)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default(),
                None => inner.global.iter().map(|(_, h)| Arc::clone(h)).collect(),
            };
            (taps, targets)
        };

        for tap in &taps {
            tap(env);
        }
        if targets.is_empty() {
            tracing::trace!(kind = %env.kind, session_id = ?env.session_id, "No subscriber for event");
        }
        for handler in &targets {
            handler(env);
        }
        targets.len()
    }

    /// Number of live subscribers, session and global. Taps are not counted.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.global.len() + inner.sessions.values().map(Vec::len).sum::<usize>()
    }

    /// Number of subscribers for one session.
    #[must_use]
    pub fn session_subscriber_count(&self, session_id: &str) -> usize {
        self.inner.lock().sessions.get(session_id).map_or(0, Vec::len)
    }

    /// Sessions that currently have at least one subscriber.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Handle to a registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    registry: Weak<Registry>,
    scope: Scope,
    id: u64,
    active: bool,
}

impl Subscription {
    /// The session this subscription is scoped to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match &self.scope {
            Scope::Session(sid) => Some(sid),
            _ => None,
        }
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.scope, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.scope)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Envelope) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Envelope| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn event(session: Option<&str>) -> Envelope {
        let mut body = json!({"type": "tool_output"});
        if let Some(sid) = session {
            body["sessionId"] = json!(sid);
        }
        Envelope::from_value(body).unwrap()
    }

    #[test]
    fn test_session_events_reach_only_that_session() {
        let registry = Registry::new();
        let (s1, h1) = counter();
        let (s2, h2) = counter();
        let (global, hg) = counter();
        let _a = registry.subscribe_session("s1", h1);
        let _b = registry.subscribe_session("s2", h2);
        let _g = registry.subscribe_global(hg);

        assert_eq!(registry.dispatch(&event(Some("s1"))), 1);
        assert_eq!(registry.dispatch(&event(None)), 1);

        assert_eq!(s1.load(Ordering::SeqCst), 1);
        assert_eq!(s2.load(Ordering::SeqCst), 0);
        assert_eq!(global.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_prunes_empty_session() {
        let registry = Registry::new();
        let (count, handler) = counter();
        let sub = registry.subscribe_session("s1", handler);
        assert_eq!(registry.session_ids(), vec!["s1".to_owned()]);

        sub.unsubscribe();
        assert!(registry.session_ids().is_empty());
        assert_eq!(registry.subscriber_count(), 0);
        assert_eq!(registry.dispatch(&event(Some("s1"))), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = Registry::new();
        {
            let (_count, handler) = counter();
            let _sub = registry.subscribe_global(handler);
            assert_eq!(registry.subscriber_count(), 1);
        }
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_taps_see_everything_but_are_not_subscribers() {
        let registry = Registry::new();
        let (seen, tap) = counter();
        let _tap = registry.add_tap(tap);

        registry.dispatch(&event(Some("s1")));
        registry.dispatch(&event(None));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_dispatch() {
        let registry = Registry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in = Arc::clone(&slot);
        let sub = registry.subscribe_global(move |_| {
            if let Some(sub) = slot_in.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        registry.dispatch(&event(None));
        assert_eq!(registry.subscriber_count(), 0);
    }
}
