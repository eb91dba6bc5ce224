//! How the manager builds the pieces of a new session.

use std::sync::Arc;

use eventsub_stream::{
    AccountConfig, RefreshingTokenProvider, SessionConfig, TokenProvider, Transport,
    TransportFactory,
};

/// Builds transports, token providers and session configs for new sessions.
pub trait SessionFactory: Send + Sync {
    /// Transport for a new session of `account`.
    fn transport(&self, account: &AccountConfig) -> Box<dyn Transport>;

    /// Token provider for a new session. Defaults to the refresh-token grant.
    fn tokens(&self, account: &AccountConfig) -> Arc<dyn TokenProvider> {
        Arc::new(RefreshingTokenProvider::from_account(account))
    }

    /// Session settings for `account`. Defaults to [`SessionConfig::new`].
    fn config(&self, account: AccountConfig) -> SessionConfig {
        SessionConfig::new(account)
    }
}

/// Default factory: transports from a [`TransportFactory`], everything else
/// from the trait defaults.
pub struct DefaultSessionFactory {
    transports: Arc<dyn TransportFactory>,
}

impl DefaultSessionFactory {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self { transports }
    }
}

impl SessionFactory for DefaultSessionFactory {
    fn transport(&self, account: &AccountConfig) -> Box<dyn Transport> {
        self.transports.create(account)
    }
}
