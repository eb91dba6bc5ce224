//! Configuration types for the eventsub-stream crate
//!
//! `AccountConfig` carries the opaque credential surface of one account and
//! deserializes from the same field names the plugin's config node stores.
//! `SessionConfig` adds the timing knobs that drive the session lifecycle.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SessionError;
use crate::types::{AccountId, EventKind, Normalizer, SubscriptionRequest};

/// Credentials and endpoint for one upstream account.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Broadcaster account the session subscribes for
    #[serde(rename = "twitch_user_id")]
    pub account_id: AccountId,

    /// Application client id
    #[serde(rename = "twitch_client_id")]
    pub client_id: String,

    /// Application client secret
    #[serde(rename = "twitch_client_secret")]
    pub client_secret: String,

    /// Refresh token; absent until the device-code login has completed
    #[serde(rename = "twitch_refresh_token", default)]
    pub refresh_token: Option<String>,

    /// Login name, used only for status text
    #[serde(rename = "twitch_user_login", default)]
    pub user_login: Option<String>,

    /// Override for the push-service endpoint
    #[serde(default)]
    pub endpoint: Option<Url>,
}

impl AccountConfig {
    /// Create an account config with the required fields.
    pub fn new(
        account_id: impl Into<AccountId>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: None,
            user_login: None,
            endpoint: None,
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_user_login(mut self, login: impl Into<String>) -> Self {
        self.user_login = Some(login.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Name shown in status text.
    pub fn display_name(&self) -> &str {
        self.user_login.as_deref().unwrap_or("unknown")
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("account_id", &self.account_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("user_login", &self.user_login)
            .field("endpoint", &self.endpoint.as_ref().map(Url::as_str))
            .finish()
    }
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt
    /// Default: 5 seconds
    pub initial_delay: Duration,

    /// Growth factor between attempts
    /// Default: 2
    pub multiplier: u32,

    /// Upper bound for any single delay
    /// Default: 30 seconds
    pub max_delay: Duration,

    /// Attempts before the session gives up
    /// Default: 5
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Configuration for one account session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Credentials and endpoint
    pub account: AccountConfig,

    /// Reconnection backoff
    pub reconnect: ReconnectConfig,

    /// How long an issued subscription may stay unconfirmed before it is
    /// assumed active
    /// Default: 5 seconds
    pub confirmation_timeout: Duration,

    /// Upper bound for a single connect handshake
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Upper bound for teardown when a session is shut down
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,

    /// How often an idle session checks again for a token while waiting
    /// for the login flow to finish
    /// Default: 2 seconds
    pub login_poll_interval: Duration,

    /// Event kinds to subscribe on every (re)connection
    /// Default: every supported kind
    pub event_kinds: BTreeSet<EventKind>,

    /// Payload rewrites applied per kind before fan-out
    pub normalizers: BTreeMap<EventKind, Normalizer>,
}

impl SessionConfig {
    /// Create a SessionConfig with default timings
    pub fn new(account: AccountConfig) -> Self {
        Self {
            account,
            reconnect: ReconnectConfig::default(),
            confirmation_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            login_poll_interval: Duration::from_secs(2),
            event_kinds: EventKind::ALL.into_iter().collect(),
            normalizers: BTreeMap::new(),
        }
    }

    /// Create a SessionConfig with short timings for development and tests
    pub fn fast_reconnect(account: AccountConfig) -> Self {
        Self {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(50),
                multiplier: 2,
                max_delay: Duration::from_millis(300),
                max_attempts: 5,
            },
            confirmation_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            login_poll_interval: Duration::from_millis(100),
            ..Self::new(account)
        }
    }

    /// Subscription requests for every configured kind, in table order.
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.event_kinds
            .iter()
            .map(|kind| {
                let request = SubscriptionRequest::for_kind(*kind, &self.account.account_id);
                match self.normalizers.get(kind) {
                    Some(normalizer) => request.with_normalizer(normalizer.clone()),
                    None => request,
                }
            })
            .collect()
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.account.account_id.as_str().is_empty() {
            return Err(SessionError::Configuration(
                "Account id must not be empty".to_string(),
            ));
        }

        if self.account.client_id.is_empty() {
            return Err(SessionError::Configuration(
                "Client id must not be empty".to_string(),
            ));
        }

        if self.reconnect.initial_delay.is_zero() {
            return Err(SessionError::Configuration(
                "Initial reconnect delay must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(SessionError::Configuration(
                "Max reconnect delay must be >= initial reconnect delay".to_string(),
            ));
        }

        if self.reconnect.multiplier == 0 {
            return Err(SessionError::Configuration(
                "Backoff multiplier must be at least 1".to_string(),
            ));
        }

        if self.confirmation_timeout.is_zero() {
            return Err(SessionError::Configuration(
                "Confirmation timeout must be greater than 0".to_string(),
            ));
        }

        if self.login_poll_interval.is_zero() {
            return Err(SessionError::Configuration(
                "Login poll interval must be greater than 0".to_string(),
            ));
        }

        if self.event_kinds.is_empty() {
            return Err(SessionError::Configuration(
                "At least one event kind must be subscribed".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_login_poll_interval(mut self, interval: Duration) -> Self {
        self.login_poll_interval = interval;
        self
    }

    pub fn with_event_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.event_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_normalizer(mut self, kind: EventKind, normalizer: Normalizer) -> Self {
        self.normalizers.insert(kind, normalizer);
        self
    }
}
