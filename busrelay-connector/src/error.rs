//! Error types for the connector components

use thiserror::Error;

/// Connector error types
#[derive(Debug, Error)]
pub enum Error {
    /// Transient transport failure; the forwarder reconnects with backoff
    /// and host failover.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-retryable rejection. Returned by a [`Consumer`] to refuse a
    /// delivery permanently; dropped and logged, never requeued.
    ///
    /// [`Consumer`]: crate::forwarder::Consumer
    #[error("Content rejected: {0}")]
    Rejected(String),

    /// The desired priority slot was unexpectedly taken. Logged and
    /// retried on a later drift tick.
    #[error("Priority slot exhausted: {0}")]
    Exhausted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Core(#[from] busrelay_core::Error),
}

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, Error>;
