//! # eventsub-stream
//!
//! Per-account session core for Twitch EventSub.
//!
//! A session owns one persistent connection to the push service, issues a
//! subscription for every configured event kind, tracks each one by ticket
//! until it is confirmed, rejected or assumed active, recovers from dropped
//! connections with bounded exponential backoff, and fans every incoming
//! event out to the listeners attached to it.
//!
//! The wire protocol sits behind the [`Transport`] trait and credentials
//! behind [`TokenProvider`], so the lifecycle can be driven by any transport
//! implementation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventsub_stream::prelude::*;
//!
//! let account = AccountConfig::new("123456", "client-id", "client-secret")
//!     .with_refresh_token("refresh-token");
//! let tokens = Arc::new(RefreshingTokenProvider::from_account(&account));
//! let session = SessionHandle::spawn(SessionConfig::new(account), transport, tokens)?;
//!
//! let listener = session.attach(Arc::new(FnListener::new(|event, kind| {
//!     tracing::info!(%kind, "Event: {}", event.payload);
//!     Ok(())
//! })));
//!
//! // ...
//! session.detach(listener);
//! session.shutdown().await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod status;
pub mod transport;
pub mod types;

pub use auth::{AccessToken, RefreshingTokenProvider, StaticTokenProvider, TokenProvider};
pub use config::{AccountConfig, ReconnectConfig, SessionConfig};
pub use error::{AuthError, ConnectionError, Result, SessionError, SubscriptionError};
pub use fanout::{FanoutHub, FnListener, KindFilter, Listener, ListenerIdSource, ListenerResult};
pub use reconnect::Backoff;
pub use registry::{Completion, RegistryStats, SubscriptionRegistry, SubscriptionStatus};
pub use session::SessionHandle;
pub use status::{LifecycleState, SessionStatus, StatusLevel};
pub use transport::{Transport, TransportEvent, TransportFactory, TransportSink};
pub use types::{
    AccountId, CloseCode, EventKind, ListenerId, NormalizedEvent, Normalizer, SubscriptionRequest,
    TicketId,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AccountConfig, AccountId, EventKind, FnListener, KindFilter, Listener, ListenerId,
        NormalizedEvent, RefreshingTokenProvider, SessionConfig, SessionError, SessionHandle,
        SessionStatus, StatusLevel, TokenProvider, Transport, TransportEvent,
    };
}
