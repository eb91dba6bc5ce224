//! Subscription tracking keyed by ticket
//!
//! Every issued subscription gets a [`TicketId`] and a [`SubscriptionRecord`]
//! that starts out `Pending`. Results reported by the transport are matched
//! back by ticket, never by position, so any number of requests can be in
//! flight at once and resolve in any order.
//!
//! Each ticket completes exactly once. If no result arrives within the
//! confirmation timeout the record is assumed active, and a rejection slower
//! than the timeout is only logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::SubscriptionError;
use crate::transport::Transport;
use crate::types::{EventKind, Normalizer, SubscriptionRequest, TicketId};

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Issued, waiting for the upstream result
    Pending,
    /// Confirmed upstream, or assumed after the confirmation timeout
    Active,
    /// Rejected upstream
    Failed(String),
}

/// How a ticket completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The upstream service confirmed the subscription
    Confirmed,
    /// The upstream service rejected the subscription
    Rejected(String),
    /// No result arrived in time; treated as active
    Assumed,
    /// The record was discarded before it completed
    Cancelled,
}

impl Completion {
    /// Whether the subscription ended up serving events.
    pub fn is_active(&self) -> bool {
        matches!(self, Completion::Confirmed | Completion::Assumed)
    }
}

/// Mutable tracking state for one issued request.
#[derive(Debug)]
pub struct SubscriptionRecord {
    pub ticket: TicketId,
    pub request: SubscriptionRequest,
    pub upstream_id: Option<String>,
    pub status: SubscriptionStatus,
    pub issued_at: Instant,
    completion: Option<oneshot::Sender<Completion>>,
}

impl SubscriptionRecord {
    fn complete(&mut self, completion: Completion) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(completion);
        }
    }
}

/// Read-only copy of a record for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub ticket: TicketId,
    pub kind: EventKind,
    pub upstream_id: Option<String>,
    pub status: SubscriptionStatus,
}

/// Statistics about the registry state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pending: usize,
    pub active: usize,
    pub failed: usize,
}

impl RegistryStats {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.failed
    }
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} subscriptions ({} active, {} pending, {} failed)",
            self.total(),
            self.active,
            self.pending,
            self.failed
        )
    }
}

/// Outstanding issue call. Resolves once the ticket completes.
#[must_use = "a pending issue does nothing unless waited on"]
pub struct PendingIssue {
    ticket: TicketId,
    kind: EventKind,
    rx: oneshot::Receiver<Completion>,
    registry: Arc<SubscriptionRegistry>,
    timeout: Duration,
}

impl PendingIssue {
    pub fn ticket(&self) -> TicketId {
        self.ticket
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Wait for the result, assuming success once the timeout elapses.
    pub async fn wait(mut self) -> Completion {
        if let Ok(result) = tokio::time::timeout(self.timeout, &mut self.rx).await {
            return result.unwrap_or(Completion::Cancelled);
        }

        // A result may have landed between the timer firing and this call;
        // whichever completion was sent first is the one received below.
        self.registry.assume_active(self.ticket);
        (&mut self.rx).await.unwrap_or(Completion::Cancelled)
    }
}

/// Thread-safe registry of issued subscriptions.
pub struct SubscriptionRegistry {
    records: DashMap<TicketId, SubscriptionRecord>,
    next_ticket: AtomicU64,
    confirmation_timeout: Duration,
}

impl SubscriptionRegistry {
    /// Create a new registry with the given confirmation timeout
    pub fn new(confirmation_timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            confirmation_timeout,
        }
    }

    /// Record a `Pending` subscription and hand the request to the transport.
    ///
    /// Returns as soon as the transport has accepted the request. A transport
    /// that refuses to send it fails the record immediately.
    pub async fn issue(
        self: &Arc<Self>,
        request: SubscriptionRequest,
        transport: &mut dyn Transport,
    ) -> PendingIssue {
        let ticket = TicketId::new(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let kind = request.kind;
        let (tx, rx) = oneshot::channel();

        self.records.insert(
            ticket,
            SubscriptionRecord {
                ticket,
                request: request.clone(),
                upstream_id: None,
                status: SubscriptionStatus::Pending,
                issued_at: Instant::now(),
                completion: Some(tx),
            },
        );

        match transport.issue_subscription(ticket, &request).await {
            Ok(()) => tracing::debug!(%ticket, %kind, "Subscription issued"),
            Err(e) => {
                tracing::warn!(%ticket, %kind, "Failed to issue subscription: {}", e);
                self.on_result(ticket, Err(e.to_string()));
            }
        }

        PendingIssue {
            ticket,
            kind,
            rx,
            registry: Arc::clone(self),
            timeout: self.confirmation_timeout,
        }
    }

    /// Apply an upstream result to the record issued under `ticket`.
    ///
    /// Returns `true` if this result completed the ticket. Results for
    /// unknown or already completed tickets are logged and ignored.
    pub fn on_result(&self, ticket: TicketId, outcome: Result<String, String>) -> bool {
        let Some(mut record) = self.records.get_mut(&ticket) else {
            tracing::debug!(%ticket, "Result for untracked subscription ignored");
            return false;
        };

        if record.status != SubscriptionStatus::Pending {
            match outcome {
                Ok(upstream_id)
                    if record.status == SubscriptionStatus::Active
                        && record.upstream_id.is_none() =>
                {
                    tracing::debug!(%ticket, %upstream_id, "Late confirmation recorded");
                    record.upstream_id = Some(upstream_id);
                }
                Ok(_) => {}
                Err(reason) => tracing::warn!(
                    %ticket,
                    kind = %record.request.kind,
                    "Late rejection ignored, subscription already {:?}: {}",
                    record.status,
                    reason
                ),
            }
            return false;
        }

        let completion = match outcome {
            Ok(upstream_id) => {
                record.upstream_id = Some(upstream_id);
                record.status = SubscriptionStatus::Active;
                Completion::Confirmed
            }
            Err(reason) => {
                let error = SubscriptionError::Rejected {
                    kind: record.request.kind,
                    reason: reason.clone(),
                };
                tracing::warn!(%ticket, "{}", error);
                record.status = SubscriptionStatus::Failed(reason.clone());
                Completion::Rejected(reason)
            }
        };
        record.complete(completion);
        true
    }

    /// Move a still-pending record to `Active` without confirmation.
    fn assume_active(&self, ticket: TicketId) -> bool {
        let Some(mut record) = self.records.get_mut(&ticket) else {
            return false;
        };
        if record.status != SubscriptionStatus::Pending {
            return false;
        }

        tracing::warn!(
            %ticket,
            kind = %record.request.kind,
            "No confirmation within {:?}, assuming subscription is active",
            self.confirmation_timeout
        );
        record.status = SubscriptionStatus::Active;
        record.complete(Completion::Assumed);
        true
    }

    /// Remove one record, deleting it upstream if it was active.
    pub async fn revoke(
        &self,
        ticket: TicketId,
        transport: &mut dyn Transport,
    ) -> Result<(), SubscriptionError> {
        let (_, record) = self
            .records
            .remove(&ticket)
            .ok_or(SubscriptionError::UnknownTicket(ticket))?;

        match (&record.status, &record.upstream_id) {
            (SubscriptionStatus::Active, Some(upstream_id)) => {
                transport.revoke_subscription(upstream_id).await
            }
            _ => Ok(()),
        }
    }

    /// Revoke every active subscription, then forget all records.
    ///
    /// Best effort: a failed revocation is logged and the batch continues.
    /// Returns the number of subscriptions revoked upstream.
    pub async fn revoke_all(&self, transport: &mut dyn Transport) -> usize {
        let mut active: Vec<(TicketId, String)> = self
            .records
            .iter()
            .filter(|r| r.status == SubscriptionStatus::Active)
            .filter_map(|r| r.upstream_id.clone().map(|id| (r.ticket, id)))
            .collect();
        active.sort_by_key(|(ticket, _)| *ticket);

        let mut revoked = 0;
        for (ticket, upstream_id) in active {
            match transport.revoke_subscription(&upstream_id).await {
                Ok(()) => revoked += 1,
                Err(e) => tracing::warn!(
                    %ticket,
                    %upstream_id,
                    "Failed to revoke subscription: {}",
                    e
                ),
            }
        }

        self.clear();
        revoked
    }

    /// Forget every record. Pending tickets complete as `Cancelled`.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Resolve an upstream subscription id to the kind and normalizer of the
    /// active record that owns it.
    pub fn route(&self, upstream_id: &str) -> Option<(EventKind, Option<Normalizer>)> {
        self.records
            .iter()
            .find(|r| {
                r.status == SubscriptionStatus::Active
                    && r.upstream_id.as_deref() == Some(upstream_id)
            })
            .map(|r| (r.request.kind, r.request.normalizer.clone()))
    }

    /// Current status of a ticket.
    pub fn status(&self, ticket: TicketId) -> Option<SubscriptionStatus> {
        self.records.get(&ticket).map(|r| r.status.clone())
    }

    /// Snapshot of every record, ordered by ticket.
    pub fn records(&self) -> Vec<RecordSnapshot> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|r| RecordSnapshot {
                ticket: r.ticket,
                kind: r.request.kind,
                upstream_id: r.upstream_id.clone(),
                status: r.status.clone(),
            })
            .collect();
        records.sort_by_key(|r| r.ticket);
        records
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for record in self.records.iter() {
            match record.status {
                SubscriptionStatus::Pending => stats.pending += 1,
                SubscriptionStatus::Active => stats.active += 1,
                SubscriptionStatus::Failed(_) => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessToken;
    use crate::config::AccountConfig;
    use crate::error::ConnectionError;
    use crate::transport::TransportSink;
    use crate::types::AccountId;
    use async_trait::async_trait;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingTransport {
        issued: Vec<TicketId>,
        revoked: Vec<String>,
        fail_issue: bool,
        fail_revoke: HashSet<String>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(
            &mut self,
            _account: &AccountConfig,
            _token: &AccessToken,
            _sink: TransportSink,
        ) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn issue_subscription(
            &mut self,
            ticket: TicketId,
            _request: &SubscriptionRequest,
        ) -> Result<(), SubscriptionError> {
            if self.fail_issue {
                return Err(SubscriptionError::Transport("socket closed".to_string()));
            }
            self.issued.push(ticket);
            Ok(())
        }

        async fn revoke_subscription(
            &mut self,
            subscription_id: &str,
        ) -> Result<(), SubscriptionError> {
            if self.fail_revoke.contains(subscription_id) {
                return Err(SubscriptionError::Transport("revoke failed".to_string()));
            }
            self.revoked.push(subscription_id.to_string());
            Ok(())
        }

        async fn stop(&mut self) {}
    }

    fn request(kind: EventKind) -> SubscriptionRequest {
        SubscriptionRequest::for_kind(kind, &AccountId::new("42"))
    }

    fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_confirmed_and_rejected() {
        let registry = registry();
        let mut transport = RecordingTransport::default();

        let follow = registry
            .issue(request(EventKind::ChannelFollow), &mut transport)
            .await;
        let raid = registry
            .issue(request(EventKind::ChannelRaidTo), &mut transport)
            .await;
        assert_eq!(registry.stats().pending, 2);

        assert!(registry.on_result(follow.ticket(), Ok("sub-1".to_string())));
        assert!(registry.on_result(raid.ticket(), Err("missing scope".to_string())));

        let follow_ticket = follow.ticket();
        assert_eq!(follow.wait().await, Completion::Confirmed);
        assert_eq!(
            raid.wait().await,
            Completion::Rejected("missing scope".to_string())
        );

        assert_eq!(registry.status(follow_ticket), Some(SubscriptionStatus::Active));
        assert_eq!(
            registry.route("sub-1").map(|(kind, _)| kind),
            Some(EventKind::ChannelFollow)
        );
        assert_eq!(
            registry.stats(),
            RegistryStats {
                pending: 0,
                active: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_status_never_goes_backwards() {
        let registry = registry();
        let mut transport = RecordingTransport::default();
        let pending = registry
            .issue(request(EventKind::ChannelFollow), &mut transport)
            .await;
        let ticket = pending.ticket();

        assert!(registry.on_result(ticket, Err("duplicate".to_string())));
        assert!(!registry.on_result(ticket, Ok("sub-9".to_string())));
        assert_eq!(
            registry.status(ticket),
            Some(SubscriptionStatus::Failed("duplicate".to_string()))
        );
        assert!(registry.route("sub-9").is_none());
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_ignored() {
        let registry = registry();
        assert!(!registry.on_result(TicketId::new(99), Ok("sub".to_string())));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_issue_failure_fails_record() {
        let registry = registry();
        let mut transport = RecordingTransport {
            fail_issue: true,
            ..Default::default()
        };

        let pending = registry
            .issue(request(EventKind::ChannelStreamOnline), &mut transport)
            .await;
        assert!(matches!(pending.wait().await, Completion::Rejected(_)));
        assert_eq!(registry.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_assumes_active_once() {
        let registry = registry();
        let mut transport = RecordingTransport::default();
        let pending = registry
            .issue(request(EventKind::ChannelSubscription), &mut transport)
            .await;
        let ticket = pending.ticket();

        assert_eq!(pending.wait().await, Completion::Assumed);
        assert_eq!(registry.status(ticket), Some(SubscriptionStatus::Active));

        // The late result neither completes the ticket again nor changes status,
        // but its id is kept so events can be routed.
        assert!(!registry.on_result(ticket, Ok("late-sub".to_string())));
        assert_eq!(registry.status(ticket), Some(SubscriptionStatus::Active));
        assert_eq!(
            registry.route("late-sub").map(|(kind, _)| kind),
            Some(EventKind::ChannelSubscription)
        );

        assert!(!registry.on_result(ticket, Err("too late".to_string())));
        assert_eq!(registry.status(ticket), Some(SubscriptionStatus::Active));
    }

    #[tokio::test]
    async fn test_results_match_tickets_in_any_order() {
        let registry = registry();
        let mut transport = RecordingTransport::default();

        let mut pending = Vec::new();
        for kind in EventKind::ALL {
            pending.push(registry.issue(request(kind), &mut transport).await);
        }
        assert_eq!(transport.issued.len(), EventKind::ALL.len());

        for issue in pending.iter().rev() {
            let upstream_id = format!("sub-{}", issue.kind());
            assert!(registry.on_result(issue.ticket(), Ok(upstream_id)));
        }

        for issue in pending {
            let kind = issue.kind();
            assert_eq!(issue.wait().await, Completion::Confirmed);
            assert_eq!(
                registry.route(&format!("sub-{kind}")).map(|(k, _)| k),
                Some(kind)
            );
        }
    }

    #[tokio::test]
    async fn test_revoke_all_is_best_effort() {
        let registry = registry();
        let mut transport = RecordingTransport::default();
        transport.fail_revoke.insert("sub-2".to_string());

        let mut tickets = Vec::new();
        for kind in [
            EventKind::ChannelFollow,
            EventKind::ChannelRaidTo,
            EventKind::ChannelStreamOnline,
        ] {
            tickets.push(registry.issue(request(kind), &mut transport).await);
        }
        for (i, issue) in tickets.iter().enumerate() {
            registry.on_result(issue.ticket(), Ok(format!("sub-{}", i + 1)));
        }

        let revoked = registry.revoke_all(&mut transport).await;
        assert_eq!(revoked, 2);
        assert_eq!(transport.revoked, vec!["sub-1".to_string(), "sub-3".to_string()]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_clear_cancels_pending() {
        let registry = registry();
        let mut transport = RecordingTransport::default();
        let pending = registry
            .issue(request(EventKind::ChannelFollow), &mut transport)
            .await;

        registry.clear();
        assert_eq!(pending.wait().await, Completion::Cancelled);
    }

    #[tokio::test]
    async fn test_revoke_single() {
        let registry = registry();
        let mut transport = RecordingTransport::default();
        let pending = registry
            .issue(request(EventKind::ChannelFollow), &mut transport)
            .await;
        let ticket = pending.ticket();
        registry.on_result(ticket, Ok("sub-1".to_string()));

        registry.revoke(ticket, &mut transport).await.unwrap();
        assert_eq!(transport.revoked, vec!["sub-1".to_string()]);
        assert!(matches!(
            registry.revoke(ticket, &mut transport).await,
            Err(SubscriptionError::UnknownTicket(_))
        ));
    }
}
