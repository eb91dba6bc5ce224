//! Access-token holders.
//!
//! A session asks its [`TokenProvider`] for the current access token before
//! every connect, and listens on [`TokenProvider::refresh_failures`] for the
//! moment the credential stops being refreshable.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::config::AccountConfig;
use crate::error::AuthError;

/// Default identity endpoint for the refresh-token grant.
pub const DEFAULT_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// An access token and, when known, the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// The bearer value.
    pub fn as_str(&self) -> &str {
        &self.secret
    }

    /// Whether the token is still usable for at least `margin`.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + margin < expires_at,
            None => true,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of access tokens for one account.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, refreshing it first if needed.
    async fn access_token(&self) -> Result<AccessToken, AuthError>;

    /// Signal fired whenever a refresh fails.
    fn refresh_failures(&self) -> broadcast::Receiver<AuthError>;
}

/// Holds a pre-issued token. Refresh failure can be injected by the owner.
pub struct StaticTokenProvider {
    token: Mutex<Option<AccessToken>>,
    failures: broadcast::Sender<AuthError>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        let (failures, _) = broadcast::channel(8);
        Self {
            token: Mutex::new(Some(AccessToken::new(token, None))),
            failures,
        }
    }

    /// A provider with no token at all.
    pub fn unauthenticated() -> Self {
        let (failures, _) = broadcast::channel(8);
        Self {
            token: Mutex::new(None),
            failures,
        }
    }

    /// Replace the token, e.g. once a login flow has produced one.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock() = Some(AccessToken::new(token, None));
    }

    /// Invalidate the token and notify subscribers that refresh failed.
    pub fn fail_refresh(&self, reason: impl Into<String>) {
        let error = AuthError::RefreshFailed(reason.into());
        *self.token.lock() = None;
        let _ = self.failures.send(error);
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<AccessToken, AuthError> {
        self.token.lock().clone().ok_or(AuthError::NotAuthenticated)
    }

    fn refresh_failures(&self) -> broadcast::Receiver<AuthError> {
        self.failures.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Refreshes access tokens with the refresh-token grant and caches them.
///
/// The identity service rotates refresh tokens; the latest one is kept in
/// memory for the lifetime of the provider.
pub struct RefreshingTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: tokio::sync::Mutex<Option<String>>,
    cached: tokio::sync::Mutex<Option<AccessToken>>,
    failures: broadcast::Sender<AuthError>,
}

impl RefreshingTokenProvider {
    /// Build a provider from an account's credentials.
    pub fn from_account(account: &AccountConfig) -> Self {
        let (failures, _) = broadcast::channel(8);
        Self {
            http: reqwest::Client::new(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
            refresh_token: tokio::sync::Mutex::new(
                account.refresh_token.clone().filter(|t| !t.is_empty()),
            ),
            cached: tokio::sync::Mutex::new(None),
            failures,
        }
    }

    /// Point the grant at a different identity endpoint.
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Install a refresh token obtained after construction, typically by the
    /// device-code login. Drops any cached access token.
    pub async fn set_refresh_token(&self, token: impl Into<String>) {
        let token = token.into();
        *self.refresh_token.lock().await = Some(token).filter(|t| !t.is_empty());
        *self.cached.lock().await = None;
        tracing::debug!(client_id = %self.client_id, "Refresh token updated");
    }

    async fn refresh(&self) -> Result<AccessToken, AuthError> {
        let mut refresh_token = self.refresh_token.lock().await;
        let current = refresh_token.clone().ok_or(AuthError::NotAuthenticated)?;

        tracing::debug!(client_id = %self.client_id, "Refreshing access token");

        let response = self
            .http
            .post(self.token_url.as_str())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = AuthError::RefreshFailed(format!("{status}: {body}"));
            tracing::warn!(client_id = %self.client_id, "Access token refresh rejected: {}", error);
            let _ = self.failures.send(error.clone());
            return Err(error);
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Http(format!("invalid token response: {e}")))?;

        if let Some(rotated) = parsed.refresh_token {
            *refresh_token = Some(rotated);
        }

        let expires_at = parsed
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        Ok(AccessToken::new(parsed.access_token, expires_at))
    }
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn access_token(&self) -> Result<AccessToken, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(EXPIRY_MARGIN)) {
            return Ok(token.clone());
        }

        let token = self.refresh().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    fn refresh_failures(&self) -> broadcast::Receiver<AuthError> {
        self.failures.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_fails_refresh() {
        let provider = StaticTokenProvider::new("abc");
        let mut failures = provider.refresh_failures();

        assert_eq!(provider.access_token().await.unwrap().as_str(), "abc");

        provider.fail_refresh("invalid_grant");
        let error = failures.recv().await.unwrap();
        assert!(matches!(error, AuthError::RefreshFailed(ref r) if r == "invalid_grant"));
        assert!(matches!(
            provider.access_token().await,
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_refreshing_provider_without_refresh_token() {
        let account = AccountConfig::new("1234", "client", "secret");
        let provider = RefreshingTokenProvider::from_account(&account);
        assert!(matches!(
            provider.access_token().await,
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_static_provider_gets_token_later() {
        let provider = StaticTokenProvider::unauthenticated();
        assert!(matches!(
            provider.access_token().await,
            Err(AuthError::NotAuthenticated)
        ));

        provider.set_token("late");
        assert_eq!(provider.access_token().await.unwrap().as_str(), "late");
    }

    #[tokio::test]
    async fn test_refresh_token_set_after_login() {
        let account = AccountConfig::new("1234", "client", "secret");
        // Nothing listens on the discard port, so the grant fails at the HTTP layer.
        let provider = RefreshingTokenProvider::from_account(&account)
            .with_token_url("http://127.0.0.1:9/oauth2/token");

        provider.set_refresh_token("").await;
        assert!(matches!(
            provider.access_token().await,
            Err(AuthError::NotAuthenticated)
        ));

        provider.set_refresh_token("r3fr3sh").await;
        assert!(matches!(provider.access_token().await, Err(AuthError::Http(_))));
    }

    #[test]
    fn test_token_freshness_and_redaction() {
        let expired = AccessToken::new("t", Some(Instant::now()));
        assert!(!expired.is_fresh(EXPIRY_MARGIN));

        let long_lived = AccessToken::new("t", Some(Instant::now() + Duration::from_secs(3600)));
        assert!(long_lived.is_fresh(EXPIRY_MARGIN));
        assert!(AccessToken::new("t", None).is_fresh(EXPIRY_MARGIN));

        assert!(!format!("{:?}", AccessToken::new("s3cret", None)).contains("s3cret"));
    }

    #[test]
    fn test_token_response_parsing() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":14400,"scope":["chat:read"],"token_type":"bearer"}"#,
        )
        .unwrap();
        assert_eq!(parsed.access_token, "a");
        assert_eq!(parsed.refresh_token.as_deref(), Some("r"));
        assert_eq!(parsed.expires_in, Some(14400));
    }
}
