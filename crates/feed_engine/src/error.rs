//! Errors surfaced by the feed engine.
//!
//! The kinds map onto what the rendering layer does with them:
//!
//! - [`Transport`] the network failed or timed out (including a failed auth
//!   refresh); mutations are rolled back and the UI offers a retry.
//! - [`Validation`] the server rejected the payload; the message is passed
//!   through verbatim.
//! - [`StaleFingerprint`] a next-page fetch hit an invalidated feed; never
//!   shown to users, the engine answers it with a first-page fetch.
//!
//!  [`Transport`]: FeedError::Transport
//!  [`Validation`]: FeedError::Validation
//!  [`StaleFingerprint`]: FeedError::StaleFingerprint
use thiserror::Error;

use crate::remote::RemoteError;

const SESSION_EXPIRED: &str = "session expired";

/// Feed engine errors.
///
/// `Clone` so that coalesced fetches can hand the same outcome to every
/// waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0}")]
    Validation(String),
    #[error("\"{0}\" not found!")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("stale fingerprint: {0}")]
    StaleFingerprint(String),
    #[error("\"{0}\" has not been confirmed by the server")]
    Unconfirmed(String),
}

impl FeedError {
    /// Whether the UI should offer a retry affordance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The server rejected the session and it could not be refreshed.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::Transport(message) if message == SESSION_EXPIRED)
    }
}

impl From<RemoteError> for FeedError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized => Self::Transport(SESSION_EXPIRED.to_string()),
            RemoteError::Forbidden => Self::Transport("access denied".to_string()),
            RemoteError::NotFound(what) => Self::NotFound(what),
            RemoteError::Conflict(message) => Self::Conflict(message),
            RemoteError::Validation(message) => Self::Validation(message),
            RemoteError::Server(message) => Self::Transport(format!("server error: {message}")),
            RemoteError::Transport(message) => Self::Transport(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_surface_as_retryable_session_expiry() {
        let err = FeedError::from(RemoteError::Unauthorized);
        assert!(err.is_retryable());
        assert!(err.is_session_expired());
        assert!(!FeedError::from(RemoteError::Forbidden).is_session_expired());
    }

    #[test]
    fn server_validation_messages_pass_through() {
        let err = FeedError::from(RemoteError::Validation("amount too large".to_string()));
        assert_eq!(err.to_string(), "amount too large");
        assert!(!err.is_retryable());
    }
}
