//! Event fan-out to attached listeners
//!
//! The hub owns the listener set of one session. Dispatch takes a snapshot of
//! the set and iterates it outside the lock, so listeners can attach and
//! detach while an event is being delivered. A listener that returns an error
//! or panics is logged and skipped; the rest still receive the event.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::status::SessionStatus;
use crate::types::{EventKind, ListenerId, NormalizedEvent};

/// Result of a listener callback.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives events and status updates from a session.
pub trait Listener: Send + Sync {
    /// Called once per upstream event.
    fn on_event(&self, event: &NormalizedEvent, kind: EventKind) -> ListenerResult;

    /// Called on every session status transition, and once on attach with the
    /// current status.
    fn on_status(&self, _status: &SessionStatus) {}
}

/// Adapts a closure into a [`Listener`] that ignores status updates.
pub struct FnListener<F>(F);

impl<F> FnListener<F>
where
    F: Fn(&NormalizedEvent, EventKind) -> ListenerResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Listener for FnListener<F>
where
    F: Fn(&NormalizedEvent, EventKind) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &NormalizedEvent, kind: EventKind) -> ListenerResult {
        (self.0)(event, kind)
    }
}

/// Forwards only the selected event kinds to the wrapped listener. Status
/// updates always pass through.
pub struct KindFilter<L> {
    kinds: BTreeSet<EventKind>,
    inner: L,
}

impl<L: Listener> KindFilter<L> {
    pub fn new(kinds: impl IntoIterator<Item = EventKind>, inner: L) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            inner,
        }
    }
}

impl<L: Listener> Listener for KindFilter<L> {
    fn on_event(&self, event: &NormalizedEvent, kind: EventKind) -> ListenerResult {
        if self.kinds.contains(&kind) {
            self.inner.on_event(event, kind)
        } else {
            Ok(())
        }
    }

    fn on_status(&self, status: &SessionStatus) {
        self.inner.on_status(status)
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Hands out listener ids. Hubs sharing one source never reuse an id, so a
/// stale id from a closed session cannot match a listener of a later one.
#[derive(Debug)]
pub struct ListenerIdSource {
    next: AtomicU64,
}

impl ListenerIdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ListenerId {
        ListenerId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerIdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned listener set for one session.
pub struct FanoutHub {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener>)>>,
    ids: Arc<ListenerIdSource>,
    last_status: RwLock<SessionStatus>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::with_id_source(Arc::new(ListenerIdSource::new()))
    }

    /// A hub drawing listener ids from a shared source.
    pub fn with_id_source(ids: Arc<ListenerIdSource>) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            ids,
            last_status: RwLock::new(SessionStatus::default()),
        }
    }

    /// Add a listener and replay the current status to it.
    pub fn attach(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.insert(listener);
        self.replay_status(id);
        id
    }

    /// Add a listener without calling into it. Pair with
    /// [`FanoutHub::replay_status`] once no caller lock is held.
    pub fn insert(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.ids.next_id();
        self.listeners.write().push((id, listener));
        tracing::debug!(%id, "Listener attached");
        id
    }

    /// Send the current status to listener `id`. Returns `false` if it is no
    /// longer attached.
    pub fn replay_status(&self, id: ListenerId) -> bool {
        let listener = self
            .listeners
            .read()
            .iter()
            .find(|(listener_id, _)| *listener_id == id)
            .map(|(_, listener)| Arc::clone(listener));

        match listener {
            Some(listener) => {
                let status = self.last_status.read().clone();
                Self::notify_status(id, listener.as_ref(), &status);
                true
            }
            None => false,
        }
    }

    /// Remove a listener. Detaching an unknown id is a no-op.
    pub fn detach(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!(%id, remaining = listeners.len(), "Listener detached");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.read().iter().any(|(listener_id, _)| *listener_id == id)
    }

    fn snapshot(&self) -> Vec<(ListenerId, Arc<dyn Listener>)> {
        self.listeners.read().clone()
    }

    /// Deliver `event` to every listener attached right now.
    pub fn dispatch(&self, event: &NormalizedEvent, kind: EventKind) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (id, listener) in self.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event, kind))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(%id, %kind, "Listener failed to handle event: {}", e);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(%id, %kind, "Listener panicked while handling event");
                }
            }
        }

        report
    }

    /// Record `status` and send it to every listener.
    pub fn publish_status(&self, status: SessionStatus) {
        *self.last_status.write() = status.clone();
        for (id, listener) in self.snapshot() {
            Self::notify_status(id, listener.as_ref(), &status);
        }
    }

    /// Most recently published status.
    pub fn status(&self) -> SessionStatus {
        self.last_status.read().clone()
    }

    fn notify_status(id: ListenerId, listener: &dyn Listener, status: &SessionStatus) {
        if catch_unwind(AssertUnwindSafe(|| listener.on_status(status))).is_err() {
            tracing::error!(%id, "Listener panicked while handling status");
        }
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}
