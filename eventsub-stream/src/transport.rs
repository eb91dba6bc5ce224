//! Transport contract for the upstream push service.
//!
//! A [`Transport`] owns one persistent connection. The wire protocol lives
//! behind this trait; the session only needs connect/issue/revoke/stop and a
//! stream of [`TransportEvent`]s, which the transport pushes into the
//! [`TransportSink`] handed to it on every `connect`.
//!
//! # Contract
//!
//! - `issue_subscription` sends the request and returns; the outcome arrives
//!   later as [`TransportEvent::SubscriptionResult`] carrying the same ticket.
//!   Many tickets may be in flight at once.
//! - Every upstream notification received while connected is pushed into the
//!   sink, in arrival order, before the transport reads the next message.
//! - Every disconnect, voluntary or not, is reported as
//!   [`TransportEvent::Closed`]. [`CloseCode::NORMAL`] means no reconnect.
//! - `stop` is idempotent and safe to call before `connect` ever succeeded.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::AccessToken;
use crate::config::AccountConfig;
use crate::error::{ConnectionError, SubscriptionError};
use crate::types::{CloseCode, SubscriptionRequest, TicketId};

/// Something the transport observed on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The handshake completed; the upstream session id if there is one
    Connected { session_id: Option<String> },

    /// The upstream service confirmed (`Ok(subscription_id)`) or rejected
    /// (`Err(reason)`) the subscription issued under `ticket`
    SubscriptionResult {
        ticket: TicketId,
        outcome: Result<String, String>,
    },

    /// An event pushed for an upstream subscription
    Notification {
        subscription_id: String,
        payload: Value,
    },

    /// The connection closed
    Closed { code: CloseCode, reason: String },
}

/// Where a transport reports [`TransportEvent`]s.
pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

/// One persistent connection to the push service.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection using `token`; events go to `sink` until the
    /// next `connect` or `stop`.
    async fn connect(
        &mut self,
        account: &AccountConfig,
        token: &AccessToken,
        sink: TransportSink,
    ) -> Result<(), ConnectionError>;

    /// Ask the service to create a subscription. Must not wait for the result.
    async fn issue_subscription(
        &mut self,
        ticket: TicketId,
        request: &SubscriptionRequest,
    ) -> Result<(), SubscriptionError>;

    /// Ask the service to delete an active subscription.
    async fn revoke_subscription(&mut self, subscription_id: &str) -> Result<(), SubscriptionError>;

    /// Close the connection.
    async fn stop(&mut self);
}

/// Builds one transport per session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, account: &AccountConfig) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&AccountConfig) -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self, account: &AccountConfig) -> Box<dyn Transport> {
        self(account)
    }
}
