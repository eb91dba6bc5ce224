//! Error types for the eventsub-stream crate.

use std::time::Duration;

use crate::types::{CloseCode, EventKind, TicketId};

/// Errors raised while resolving credentials.
///
/// Rejected or missing credentials are fatal for a session: they need new
/// credentials, so the session never retries them on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// No refresh token (or user id) has been configured yet
    #[error("Not authenticated: no refresh token configured")]
    NotAuthenticated,

    /// The refresh-token grant was rejected
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// The identity endpoint could not be reached or answered garbage
    #[error("Identity endpoint error: {0}")]
    Http(String),
}

impl AuthError {
    /// Whether the error needs new credentials. Transport-level failures
    /// talking to the identity endpoint are retried like connection errors.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AuthError::Http(_))
    }
}

/// Errors establishing or holding the upstream connection. Recoverable.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The handshake with the push service did not complete
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connecting took longer than the configured connect timeout
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The connection closed with an abnormal close code
    #[error("Connection closed ({code}): {reason}")]
    Closed {
        /// Close code reported by the transport
        code: CloseCode,
        /// Free-text reason reported by the transport
        reason: String,
    },

    /// Lower-level network failure
    #[error("Network error: {0}")]
    Network(String),
}

/// Errors local to a single subscription. Never fail the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    /// The upstream service rejected the subscription
    #[error("Subscription {kind} rejected: {reason}")]
    Rejected {
        /// Event kind of the rejected request
        kind: EventKind,
        /// Rejection reason reported upstream
        reason: String,
    },

    /// The transport could not send the request or revocation
    #[error("Transport error: {0}")]
    Transport(String),

    /// No record is tracked for this ticket
    #[error("No subscription tracked for {0}")]
    UnknownTicket(TicketId),
}

/// Session-wide errors. Only the lifecycle orchestrator produces these, and
/// they surface as status updates rather than crossing attach/detach.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Credentials invalid or refresh failed
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Every reconnect attempt failed
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Teardown did not complete cleanly
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl SessionError {
    /// Whether the reconnection controller should handle this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Connection(_) => true,
            SessionError::Auth(auth) => !auth.is_fatal(),
            _ => false,
        }
    }
}

/// Convenience type alias for Results using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        assert_eq!(
            AuthError::NotAuthenticated.to_string(),
            "Not authenticated: no refresh token configured"
        );
        assert_eq!(
            AuthError::RefreshFailed("invalid_grant".to_string()).to_string(),
            "Token refresh failed: invalid_grant"
        );
    }

    #[test]
    fn test_connection_error_display() {
        let error = ConnectionError::Closed {
            code: CloseCode::new(4003),
            reason: "connection unused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Connection closed (4003): connection unused"
        );

        let error = ConnectionError::Timeout(Duration::from_secs(10));
        assert_eq!(error.to_string(), "Connect timed out after 10s");
    }

    #[test]
    fn test_subscription_error_display() {
        let error = SubscriptionError::Rejected {
            kind: EventKind::ChannelFollow,
            reason: "missing scope".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Subscription channelFollow rejected: missing scope"
        );

        let error = SubscriptionError::UnknownTicket(TicketId::new(7));
        assert_eq!(error.to_string(), "No subscription tracked for ticket-7");
    }

    #[test]
    fn test_session_error_conversion() {
        let session_error: SessionError = AuthError::NotAuthenticated.into();
        assert!(matches!(session_error, SessionError::Auth(_)));
        assert!(!session_error.is_recoverable());

        let session_error: SessionError = ConnectionError::Network("reset".to_string()).into();
        assert!(session_error.is_recoverable());
        assert_eq!(
            session_error.to_string(),
            "Connection error: Network error: reset"
        );

        let transient: SessionError = AuthError::Http("dns".to_string()).into();
        assert!(transient.is_recoverable());

        let exhausted = SessionError::ReconnectExhausted { attempts: 5 };
        assert!(!exhausted.is_recoverable());
        assert_eq!(exhausted.to_string(), "Gave up reconnecting after 5 attempts");
    }
}
