//! Error taxonomy shared by the catalog, cache, preload and sync layers.

use std::time::Duration;

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The fetch token was invalidated before the request settled.
    #[error("request cancelled")]
    Cancelled,
    /// Network or server failure.
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Requested category or media does not exist (or has no items).
    #[error("not found: {0}")]
    NotFound(String),
    /// Resource materialization did not settle in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The sync channel exhausted its reconnect attempts.
    #[error("sync unavailable: {0}")]
    SyncUnavailable(String),
    /// The host refused to start audible playback without a user gesture.
    #[error("autoplay rejected")]
    AutoplayRejected,
    /// The server answered with a payload we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Cancellation is expected control flow, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the error should reach the user when they initiated the operation.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::NotFound(_) | Error::SyncUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            Error::NotFound(e.to_string())
        } else {
            Error::Upstream(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_user_visible() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_user_visible());
        assert!(!Error::Timeout(Duration::from_secs(5)).is_user_visible());
        assert!(Error::Upstream("502".into()).is_user_visible());
        assert!(Error::NotFound("cats".into()).is_user_visible());
    }
}
