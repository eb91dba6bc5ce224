//! Sync-first EventSub manager
//!
//! Provides a fully synchronous attach/detach API keyed by account id. All
//! async work happens on a background worker thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eventsub_stream::fanout::{FanoutHub, ListenerIdSource};
use eventsub_stream::{
    AccountConfig, AccountId, Listener, ListenerId, SessionStatus, TransportFactory,
};
use tokio::sync::mpsc;

use crate::error::{EventManagerError, Result};
use crate::factory::{DefaultSessionFactory, SessionFactory};
use crate::worker::{spawn_session_worker, Command};

/// Reference-counted EventSub sessions, one per account.
///
/// The first listener attached for an account opens a session; detaching the
/// last one closes it. Session existence is decided under the account's map
/// entry lock, so at every observable point an account has a session exactly
/// when it has at least one listener. Listener ids come from one source per
/// manager and are never reused, so a stale id cannot detach a listener of a
/// later session. No listener callback runs while a map entry is locked.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use eventsub_manager::EventSubManager;
/// use eventsub_stream::{AccountConfig, FnListener};
///
/// let manager = EventSubManager::new(Arc::new(my_transport_factory))?;
///
/// let account = AccountConfig::new("123456", "client-id", "client-secret")
///     .with_refresh_token("refresh-token");
/// let listener = manager.attach(account.clone(), Arc::new(FnListener::new(|event, kind| {
///     println!("{kind}: {}", event.payload);
///     Ok(())
/// })));
///
/// // ...
/// manager.detach(&account.account_id, listener);
/// manager.shutdown()?;
/// ```
pub struct EventSubManager {
    /// Send commands to background worker
    command_tx: mpsc::UnboundedSender<Command>,

    /// Listener hubs of accounts that currently have a session
    sessions: DashMap<AccountId, Arc<FanoutHub>>,

    /// Listener ids shared by every hub this manager creates
    listener_ids: Arc<ListenerIdSource>,

    /// Background worker handle
    worker: Option<JoinHandle<()>>,
}

impl EventSubManager {
    /// Create a manager that builds transports with `transports` and
    /// everything else with the defaults.
    pub fn new(transports: Arc<dyn TransportFactory>) -> Result<Self> {
        Self::with_factory(Arc::new(DefaultSessionFactory::new(transports)))
    }

    /// Create a manager with full control over how sessions are built.
    pub fn with_factory(factory: Arc<dyn SessionFactory>) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = spawn_session_worker(factory, command_rx)?;

        Ok(Self {
            command_tx,
            sessions: DashMap::new(),
            listener_ids: Arc::new(ListenerIdSource::new()),
            worker: Some(worker),
        })
    }

    fn send(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            tracing::error!("Session worker is gone, command dropped");
        }
    }

    /// Attach a listener to the session of `account`, opening it if this is
    /// the first listener.
    pub fn attach(&self, account: AccountConfig, listener: Arc<dyn Listener>) -> ListenerId {
        let (hub, id) = match self.sessions.entry(account.account_id.clone()) {
            Entry::Occupied(entry) => {
                let hub = Arc::clone(entry.get());
                let id = hub.insert(listener);
                tracing::debug!(
                    account = %account.account_id,
                    listeners = hub.len(),
                    "Listener attached to running session"
                );
                self.send(Command::ListenerAttached {
                    account: account.account_id,
                });
                (hub, id)
            }
            Entry::Vacant(entry) => {
                let hub = Arc::new(FanoutHub::with_id_source(Arc::clone(&self.listener_ids)));
                let id = hub.insert(listener);
                tracing::info!(account = %account.account_id, "First listener attached, opening session");
                entry.insert(Arc::clone(&hub));
                self.send(Command::Open {
                    account,
                    hub: Arc::clone(&hub),
                });
                (hub, id)
            }
        };

        // The entry lock is released here; the listener may call back in.
        hub.replay_status(id);
        id
    }

    /// Detach a listener. Detaching the last listener of an account closes its
    /// session. Returns `false` if the listener was not attached.
    pub fn detach(&self, account_id: &AccountId, listener: ListenerId) -> bool {
        let Entry::Occupied(entry) = self.sessions.entry(account_id.clone()) else {
            tracing::debug!(account = %account_id, %listener, "Detach for account without session");
            return false;
        };

        if !entry.get().detach(listener) {
            return false;
        }

        if entry.get().is_empty() {
            entry.remove();
            tracing::info!(account = %account_id, "Last listener detached, closing session");
            self.send(Command::Close {
                account: account_id.clone(),
            });
        }
        true
    }

    /// Whether `account_id` currently has a session.
    pub fn has_session(&self, account_id: &AccountId) -> bool {
        self.sessions.contains_key(account_id)
    }

    /// Number of listeners attached for `account_id`.
    pub fn listener_count(&self, account_id: &AccountId) -> usize {
        self.sessions
            .get(account_id)
            .map(|hub| hub.len())
            .unwrap_or(0)
    }

    /// Latest status of the session for `account_id`.
    pub fn status(&self, account_id: &AccountId) -> Option<SessionStatus> {
        self.sessions.get(account_id).map(|hub| hub.status())
    }

    /// Accounts that currently have a session.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        accounts.sort();
        accounts
    }

    /// Close every session and stop the worker, blocking until done.
    ///
    /// Returns the first session shutdown error, if any.
    pub fn shutdown(mut self) -> Result<()> {
        self.sessions.clear();

        let (reply, errors) = std::sync::mpsc::channel();
        self.command_tx
            .send(Command::Shutdown { reply })
            .map_err(|_| EventManagerError::WorkerDisconnected)?;

        let errors = errors
            .recv()
            .map_err(|_| EventManagerError::WorkerDisconnected)?;

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| EventManagerError::WorkerDisconnected)?;
        }

        match errors.into_iter().next() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl Drop for EventSubManager {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }

        tracing::debug!(
            "EventSubManager dropping, {} active sessions",
            self.sessions.len()
        );

        // Nobody waits for the reply; the worker still tears every session down.
        let (reply, _) = std::sync::mpsc::channel();
        let _ = self.command_tx.send(Command::Shutdown { reply });
    }
}
