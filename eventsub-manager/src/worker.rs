//! Background worker thread for session management
//!
//! Spawns a thread with its own tokio runtime that owns every live
//! [`SessionHandle`] while exposing a sync API to the parent
//! EventSubManager. Commands are handled one at a time, so a session that is
//! being closed has finished its teardown before a new session for the same
//! account is opened.

use std::collections::HashMap;
use std::io;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};

use eventsub_stream::fanout::FanoutHub;
use eventsub_stream::{
    AccountConfig, AccountId, LifecycleState, SessionError, SessionHandle, SessionStatus,
    StatusLevel,
};
use tokio::sync::mpsc;

use crate::factory::SessionFactory;

/// Commands sent from the sync EventSubManager to the background worker
pub enum Command {
    /// Start a session delivering to `hub`
    Open {
        account: AccountConfig,
        hub: Arc<FanoutHub>,
    },
    /// A listener was added to the hub of a running session
    ListenerAttached { account: AccountId },
    /// Tear down the session of an account
    Close { account: AccountId },
    /// Tear down every session and stop the worker
    Shutdown {
        reply: std_mpsc::Sender<Vec<SessionError>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Open { account, .. } => write!(f, "Open({})", account.account_id),
            Command::ListenerAttached { account } => write!(f, "ListenerAttached({account})"),
            Command::Close { account } => write!(f, "Close({account})"),
            Command::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

/// Spawns the background session worker thread
///
/// The worker owns its own tokio runtime, on which every session actor runs.
pub fn spawn_session_worker(
    factory: Arc<dyn SessionFactory>,
    command_rx: mpsc::UnboundedReceiver<Command>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("eventsub-worker".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to create tokio runtime for session worker: {}", e);
                    return;
                }
            };

            rt.block_on(run_worker_loop(factory, command_rx));
        })
}

/// Main command loop running inside the tokio runtime
async fn run_worker_loop(
    factory: Arc<dyn SessionFactory>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut sessions: HashMap<AccountId, SessionHandle> = HashMap::new();

    tracing::info!("Session worker started");

    while let Some(command) = command_rx.recv().await {
        tracing::debug!(?command, "Worker command");
        match command {
            Command::Open { account, hub } => {
                let account_id = account.account_id.clone();
                if let Some(previous) = sessions.remove(&account_id) {
                    tracing::warn!(account = %account_id, "Replacing a session that was never closed");
                    if let Err(e) = previous.shutdown().await {
                        tracing::warn!(account = %account_id, "Previous session shutdown failed: {}", e);
                    }
                }

                let transport = factory.transport(&account);
                let tokens = factory.tokens(&account);
                let config = factory.config(account);

                match SessionHandle::spawn_with_hub(config, transport, tokens, Arc::clone(&hub)) {
                    Ok(session) => {
                        tracing::info!(account = %account_id, "Session opened");
                        sessions.insert(account_id, session);
                    }
                    Err(e) => {
                        tracing::error!(account = %account_id, "Failed to open session: {}", e);
                        hub.publish_status(SessionStatus::new(
                            LifecycleState::Idle,
                            StatusLevel::Red,
                            e.to_string(),
                        ));
                    }
                }
            }
            Command::ListenerAttached { account } => {
                if let Some(session) = sessions.get(&account) {
                    session.notify_attached();
                }
            }
            Command::Close { account } => match sessions.remove(&account) {
                Some(session) => {
                    if let Err(e) = session.shutdown().await {
                        tracing::warn!(account = %account, "Session shutdown failed: {}", e);
                    } else {
                        tracing::info!(account = %account, "Session closed");
                    }
                }
                None => tracing::debug!(account = %account, "No session to close"),
            },
            Command::Shutdown { reply } => {
                tracing::info!("Worker received shutdown command");
                let mut errors = Vec::new();
                for (account, session) in sessions.drain() {
                    if let Err(e) = session.shutdown().await {
                        tracing::warn!(account = %account, "Session shutdown failed: {}", e);
                        errors.push(e);
                    }
                }
                let _ = reply.send(errors);
                break;
            }
        }
    }

    // The manager went away without shutting down.
    for (account, session) in sessions.drain() {
        if let Err(e) = session.shutdown().await {
            tracing::warn!(account = %account, "Session shutdown failed: {}", e);
        }
    }

    tracing::info!("Session worker stopped");
}
