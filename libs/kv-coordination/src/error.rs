//! Error types for coordination-service operations.
//!
//! Typed variants let the binding engine tell transient failures (worth a
//! retry with backoff) apart from configuration and contract errors without
//! leaking NATS internals.

use thiserror::Error;

/// Top-level error type for the kv-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// NATS connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for a response.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration error (e.g. missing required fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client is not connected or connection was lost.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A path that cannot be mapped onto the coordination namespace.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The watch was dropped by the service before it fired.
    #[error("watch on {0} closed before firing")]
    WatchClosed(String),

    /// The election participation was closed.
    #[error("election on {0} is closed")]
    ElectionClosed(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport, timeout, dropped watch or connection loss).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_)
                | CoordinationError::Timeout(_)
                | CoordinationError::NotConnected(_)
                | CoordinationError::WatchClosed(_)
        )
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
