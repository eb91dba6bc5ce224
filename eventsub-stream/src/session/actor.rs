//! Session actor
//!
//! One task per account drives the whole lifecycle. It owns the transport and
//! processes commands, transport events, settle notifications, the backoff
//! timer and refresh failures one at a time from a single `select!` loop, so
//! session state is never mutated concurrently.
//!
//! Each activation runs under a generation number. Tearing down or losing the
//! connection bumps the generation, which turns any settle notification still
//! in flight into a no-op. A fresh event channel is created on every connect,
//! so events from a previous connection are never processed.
//!
//! Token fetches and connect handshakes keep answering commands while they
//! run. A shutdown or the last listener leaving cuts them short.

use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::auth::TokenProvider;
use crate::config::SessionConfig;
use crate::error::{AuthError, ConnectionError, Result, SessionError};
use crate::fanout::{FanoutHub, Listener};
use crate::reconnect::Backoff;
use crate::registry::{Completion, RecordSnapshot, RegistryStats, SubscriptionRegistry};
use crate::session::state::{self, Transition};
use crate::status::{LifecycleState, SessionStatus, StatusLevel};
use crate::transport::{Transport, TransportEvent};
use crate::types::{AccountId, EventKind, ListenerId, NormalizedEvent};

/// Commands sent from a [`SessionHandle`] to its actor
#[derive(Debug)]
enum Command {
    /// A listener was added to the hub
    ListenerAttached,
    /// A listener was removed from the hub
    ListenerDetached,
    /// Tear down and exit
    Shutdown { reply: oneshot::Sender<()> },
    /// Every handle is gone; produced by the actor itself
    HandleDropped,
}

/// Every subscription of one activation has completed.
#[derive(Debug)]
struct Settled {
    generation: u64,
    outcomes: Vec<(EventKind, Completion)>,
}

/// Handle to a running session.
///
/// Listeners are attached and detached synchronously on the session's hub; the
/// actor is told about every change and connects or tears down accordingly.
/// Dropping the handle without calling [`SessionHandle::shutdown`] still tears
/// the session down once the actor notices.
pub struct SessionHandle {
    account_id: AccountId,
    commands: mpsc::UnboundedSender<Command>,
    hub: Arc<FanoutHub>,
    registry: Arc<SubscriptionRegistry>,
    status: watch::Receiver<SessionStatus>,
    shutdown_timeout: Duration,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Validate `config` and start the session actor on the current tokio
    /// runtime. The session stays idle until the first listener attaches.
    pub fn spawn(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Self::spawn_with_hub(config, transport, tokens, Arc::new(FanoutHub::new()))
    }

    /// Like [`SessionHandle::spawn`], but delivering to an existing hub.
    pub fn spawn_with_hub(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        hub: Arc<FanoutHub>,
    ) -> Result<Self> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::idle());
        let registry = Arc::new(SubscriptionRegistry::new(config.confirmation_timeout));
        let refresh_failures = tokens.refresh_failures();

        let account_id = config.account.account_id.clone();
        let shutdown_timeout = config.shutdown_timeout;

        let actor = SessionActor {
            backoff: Backoff::new(config.reconnect),
            config,
            transport,
            tokens,
            hub: Arc::clone(&hub),
            registry: Arc::clone(&registry),
            state: LifecycleState::Idle,
            generation: 0,
            status_tx,
            commands: command_rx,
            events: None,
            settle_tx,
            settle_rx,
            retry: None,
            login_poll: None,
            deferred: None,
            refresh_failures,
            refresh_open: true,
        };

        // Listeners attached before the actor starts are picked up here.
        let _ = commands.send(Command::ListenerAttached);

        let task = tokio::spawn(actor.run());
        tracing::debug!(account = %account_id, "Session spawned");

        Ok(Self {
            account_id,
            commands,
            hub,
            registry,
            status,
            shutdown_timeout,
            task,
        })
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Attach a listener. The first listener activates the session.
    pub fn attach(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.hub.attach(listener);
        self.notify_attached();
        id
    }

    /// Tell the actor a listener was attached directly on the shared hub.
    pub fn notify_attached(&self) {
        if self.commands.send(Command::ListenerAttached).is_err() {
            tracing::warn!(account = %self.account_id, "Session actor is gone, listener will not be served");
        }
    }

    /// Detach a listener. Detaching the last one tears the session down.
    pub fn detach(&self, id: ListenerId) -> bool {
        let removed = self.hub.detach(id);
        if removed {
            let _ = self.commands.send(Command::ListenerDetached);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.hub.len()
    }

    /// Latest status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn subscriptions(&self) -> Vec<RecordSnapshot> {
        self.registry.records()
    }

    /// Tear the session down and wait for the actor to exit, bounded by the
    /// configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_err() {
            tracing::debug!(account = %self.account_id, "Session actor already stopped");
        }

        let task = &mut self.task;
        let finished = tokio::time::timeout(self.shutdown_timeout, async {
            let _ = done.await;
            task.await
        })
        .await;

        match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::ShutdownError(e.to_string())),
            Err(_) => {
                self.task.abort();
                Err(SessionError::ShutdownError(format!(
                    "Session for {} did not stop within {:?}",
                    self.account_id, self.shutdown_timeout
                )))
            }
        }
    }
}

struct SessionActor {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    hub: Arc<FanoutHub>,
    registry: Arc<SubscriptionRegistry>,
    backoff: Backoff,
    state: LifecycleState,
    generation: u64,
    status_tx: watch::Sender<SessionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    settle_tx: mpsc::UnboundedSender<Settled>,
    settle_rx: mpsc::UnboundedReceiver<Settled>,
    retry: Option<Pin<Box<Sleep>>>,
    login_poll: Option<Pin<Box<Sleep>>>,
    /// Command that interrupted an activation, handled on the next turn
    deferred: Option<Command>,
    refresh_failures: broadcast::Receiver<AuthError>,
    refresh_open: bool,
}

impl SessionActor {
    async fn run(mut self) {
        tracing::info!(account = %self.config.account.account_id, "Session actor started");

        loop {
            if let Some(command) = self.deferred.take() {
                if !self.on_command(command).await {
                    break;
                }
                continue;
            }

            tokio::select! {
                command = self.commands.recv() => {
                    if !self.on_command(command.unwrap_or(Command::HandleDropped)).await {
                        break;
                    }
                }

                event = next_event(&mut self.events) => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        tracing::debug!("Transport dropped its event sink");
                        self.events = None;
                    }
                },

                Some(settled) = self.settle_rx.recv() => self.on_settled(settled),

                _ = timer_elapsed(&mut self.retry) => {
                    self.retry = None;
                    self.on_retry().await;
                }

                _ = timer_elapsed(&mut self.login_poll) => {
                    self.login_poll = None;
                    self.on_login_poll().await;
                }

                failure = self.refresh_failures.recv(), if self.refresh_open => match failure {
                    Ok(error) => self.on_refresh_failed(error).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Missed refresh failure notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => self.refresh_open = false,
                },
            }
        }

        tracing::info!(account = %self.config.account.account_id, "Session actor stopped");
    }

    /// Handle one command. Returns `false` once the actor should exit.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::ListenerAttached => self.on_listener_attached().await,
            Command::ListenerDetached => self.on_listener_detached().await,
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
            Command::HandleDropped => {
                tracing::debug!("Session handle dropped, shutting down");
                self.teardown().await;
                return false;
            }
        }
        true
    }

    fn transition(&mut self, transition: Transition) -> bool {
        match state::next(self.state, transition) {
            Ok(to) => {
                tracing::debug!(from = %self.state, %to, ?transition, "Lifecycle transition");
                self.state = to;
                true
            }
            Err(e) => {
                tracing::warn!(account = %self.config.account.account_id, "{}", e);
                false
            }
        }
    }

    fn publish(&self, level: StatusLevel, text: impl Into<String>) {
        let status = SessionStatus::new(self.state, level, text);
        tracing::info!(account = %self.config.account.account_id, "Status: {}", status);
        self.status_tx.send_replace(status.clone());
        self.hub.publish_status(status);
    }

    /// Stop everything belonging to the current connection without touching
    /// the listener set.
    async fn drop_connection(&mut self) {
        self.generation += 1;
        self.events = None;
        self.retry = None;
        self.login_poll = None;
        self.registry.clear();
        self.transport.stop().await;
    }

    async fn on_listener_attached(&mut self) {
        if self.hub.is_empty() || self.state != LifecycleState::Idle {
            return;
        }
        // Also restarts a session that went idle after a fatal error.
        self.backoff.reset();
        self.activate().await;
    }

    async fn on_listener_detached(&mut self) {
        if !self.hub.is_empty() {
            return;
        }
        tracing::info!(account = %self.config.account.account_id, "Last listener detached");
        self.teardown().await;
    }

    /// Connect and issue every configured subscription. The settle step runs
    /// on its own task and reports back through `settle_rx`.
    async fn activate(&mut self) {
        if self.state == LifecycleState::Idle && !self.transition(Transition::Activate) {
            return;
        }
        self.generation += 1;
        self.login_poll = None;
        let generation = self.generation;
        self.publish(StatusLevel::Yellow, "Connecting...");

        let tokens = Arc::clone(&self.tokens);
        let token = match interruptible(&mut self.commands, &self.hub, tokens.access_token()).await
        {
            Ok(Ok(token)) => token,
            Ok(Err(AuthError::NotAuthenticated)) => {
                self.transition(Transition::Fatal);
                self.publish(StatusLevel::Yellow, "Waiting for Twitch login…");
                self.arm_login_poll();
                return;
            }
            Ok(Err(e)) => {
                self.on_failure(e.into()).await;
                return;
            }
            Err(command) => {
                self.abandon_activation(command).await;
                return;
            }
        };

        let (sink, events) = mpsc::unbounded_channel();
        self.events = Some(events);
        let timeout = self.config.connect_timeout;
        let connect = tokio::time::timeout(
            timeout,
            self.transport.connect(&self.config.account, &token, sink),
        );
        let connected = match interruptible(&mut self.commands, &self.hub, connect).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Timeout(timeout)),
            Err(command) => {
                self.abandon_activation(command).await;
                return;
            }
        };
        if let Err(e) = connected {
            self.on_failure(e.into()).await;
            return;
        }
        self.publish(StatusLevel::Yellow, "Subscribing to events...");

        let mut pending = Vec::new();
        for request in self.config.requests() {
            pending.push(self.registry.issue(request, self.transport.as_mut()).await);
        }
        tracing::debug!(generation, issued = pending.len(), "Subscriptions issued");

        let settle_tx = self.settle_tx.clone();
        tokio::spawn(async move {
            let outcomes = join_all(pending.into_iter().map(|issue| async move {
                let kind = issue.kind();
                (kind, issue.wait().await)
            }))
            .await;
            let _ = settle_tx.send(Settled { generation, outcomes });
        });
    }

    /// Give up on an activation cut short by `command`, then let the run loop
    /// handle the command.
    async fn abandon_activation(&mut self, command: Command) {
        tracing::info!(account = %self.config.account.account_id, ?command, "Activation interrupted");
        self.teardown().await;
        self.deferred = Some(command);
    }

    fn arm_login_poll(&mut self) {
        self.login_poll = Some(Box::pin(tokio::time::sleep(self.config.login_poll_interval)));
    }

    /// Check again for a token while idle for want of login.
    async fn on_login_poll(&mut self) {
        if self.state != LifecycleState::Idle || self.hub.is_empty() {
            return;
        }

        let tokens = Arc::clone(&self.tokens);
        match interruptible(&mut self.commands, &self.hub, tokens.access_token()).await {
            Ok(Err(AuthError::NotAuthenticated)) => self.arm_login_poll(),
            Ok(_) => {
                tracing::info!(account = %self.config.account.account_id, "Login completed");
                self.backoff.reset();
                self.activate().await;
            }
            Err(command) => self.deferred = Some(command),
        }
    }

    fn on_settled(&mut self, settled: Settled) {
        if settled.generation != self.generation
            || !matches!(
                self.state,
                LifecycleState::Activating | LifecycleState::Reconnecting
            )
        {
            tracing::debug!(generation = settled.generation, "Stale settle ignored");
            return;
        }

        let total = settled.outcomes.len();
        let failed: Vec<EventKind> = settled
            .outcomes
            .iter()
            .filter(|(_, completion)| !completion.is_active())
            .map(|(kind, _)| *kind)
            .collect();

        if !self.transition(Transition::Activated) {
            return;
        }
        self.backoff.reset();

        let mut text = format!("Logged in as {}", self.config.account.display_name());
        if !failed.is_empty() {
            tracing::warn!(?failed, "Some subscriptions are not active");
            text.push_str(&format!(" ({} of {} subscriptions failed)", failed.len(), total));
        }
        self.publish(StatusLevel::Green, text);
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { session_id } => {
                tracing::debug!(?session_id, "Transport connected");
            }
            TransportEvent::SubscriptionResult { ticket, outcome } => {
                self.registry.on_result(ticket, outcome);
            }
            TransportEvent::Notification {
                subscription_id,
                payload,
            } => self.deliver(subscription_id, payload),
            TransportEvent::Closed { code, reason } => {
                if code.is_normal() {
                    tracing::info!(%code, %reason, "Connection closed normally");
                    self.drop_connection().await;
                    if self.transition(Transition::Disconnected) {
                        self.publish(StatusLevel::Grey, "Disconnected");
                    }
                } else {
                    self.on_failure(ConnectionError::Closed { code, reason }.into())
                        .await;
                }
            }
        }
    }

    fn deliver(&self, subscription_id: String, payload: serde_json::Value) {
        let Some((kind, normalizer)) = self.registry.route(&subscription_id) else {
            tracing::debug!(%subscription_id, "Notification for untracked subscription dropped");
            return;
        };

        let payload = match normalizer {
            Some(normalizer) => normalizer.apply(payload),
            None => payload,
        };
        let event = NormalizedEvent {
            kind,
            account_id: self.config.account.account_id.clone(),
            subscription_id,
            payload,
            received_at: chrono::Utc::now(),
        };

        let report = self.hub.dispatch(&event, kind);
        tracing::trace!(%kind, delivered = report.delivered, failed = report.failed, "Event dispatched");
    }

    /// Route a session-wide error: recoverable ones go to the reconnection
    /// controller, anything else ends the session in a fatal idle state.
    async fn on_failure(&mut self, error: SessionError) {
        if error.is_recoverable() {
            self.schedule_reconnect(error).await;
        } else {
            self.fail(error).await;
        }
    }

    async fn schedule_reconnect(&mut self, error: SessionError) {
        if self.retry.is_some() {
            tracing::debug!("Reconnect already pending, ignoring: {}", error);
            return;
        }
        if matches!(self.state, LifecycleState::Idle | LifecycleState::Stopping) {
            return;
        }

        tracing::warn!(account = %self.config.account.account_id, "Connection lost: {}", error);
        self.drop_connection().await;
        self.transition(Transition::ConnectionLost);

        match self.backoff.next_delay() {
            Some(delay) => {
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                self.publish(
                    StatusLevel::Yellow,
                    format!(
                        "Reconnecting in {:?} (attempt {}/{})",
                        delay,
                        self.backoff.attempt(),
                        self.backoff.max_attempts()
                    ),
                );
            }
            None => {
                let attempts = self.backoff.attempt();
                self.fail(SessionError::ReconnectExhausted { attempts }).await;
            }
        }
    }

    async fn on_retry(&mut self) {
        if self.state != LifecycleState::Reconnecting || self.hub.is_empty() {
            tracing::debug!(state = %self.state, "Reconnect no longer wanted");
            return;
        }
        tracing::info!(attempt = self.backoff.attempt(), "Reconnecting");
        self.activate().await;
    }

    async fn on_refresh_failed(&mut self, error: AuthError) {
        if self.state == LifecycleState::Idle {
            tracing::debug!("Refresh failure while idle: {}", error);
            return;
        }
        self.fail(error.into()).await;
    }

    async fn fail(&mut self, error: SessionError) {
        tracing::error!(account = %self.config.account.account_id, "Session failed: {}", error);
        self.drop_connection().await;
        if self.state != LifecycleState::Idle {
            self.transition(Transition::Fatal);
        }

        let text = match &error {
            SessionError::Auth(_) => "Twitch auth failed".to_string(),
            other => other.to_string(),
        };
        self.publish(StatusLevel::Red, text);
    }

    /// Revoke subscriptions, close the transport and go idle.
    async fn teardown(&mut self) {
        self.login_poll = None;
        // Idle sessions hold no connection; fatal paths already closed it.
        if self.state == LifecycleState::Idle {
            return;
        }

        self.transition(Transition::Stop);
        self.generation += 1;
        self.retry = None;
        self.publish(StatusLevel::Grey, "Disconnecting...");

        let revoked = self.registry.revoke_all(self.transport.as_mut()).await;
        tracing::debug!(revoked, "Subscriptions revoked");
        self.transport.stop().await;
        self.events = None;
        self.backoff.reset();

        self.transition(Transition::Stopped);
        self.publish(StatusLevel::Grey, "Disconnected");
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

/// Drive `work` while still answering commands. Resolves to the command that
/// ends the activation instead: a shutdown, a dropped handle or the last
/// listener leaving.
async fn interruptible<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    hub: &FanoutHub,
    work: F,
) -> std::result::Result<F::Output, Command> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Ok(output),
            command = commands.recv() => match command {
                Some(Command::ListenerAttached) => {}
                Some(Command::ListenerDetached) if !hub.is_empty() => {}
                Some(command) => return Err(command),
                None => return Err(Command::HandleDropped),
            },
        }
    }
}

async fn timer_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
