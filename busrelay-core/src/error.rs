//! Error types shared by the core pipeline components

use thiserror::Error;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock contention on the backing store. Retried internally with a short
    /// delay; only surfaced when the retry budget is exhausted.
    #[error("Storage busy: {0}")]
    StorageBusy(String),

    /// The backing table is missing or unreadable. Fatal at construction.
    #[error("Corrupt retry store: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
