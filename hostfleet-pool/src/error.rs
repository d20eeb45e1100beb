//! Error types for the connection pool.

use thiserror::Error;

/// Errors returned synchronously by pool operations.
///
/// Health-check and close failures never appear here: the maintenance loop
/// records them in the entry and logs them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No entry exists for the host.
    #[error("Connection not found for host: {0}")]
    ConnectionNotFound(String),

    /// Establishing the connection failed.
    #[error("Failed to connect to host {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// The host configuration cannot be used as a pool key.
    #[error("Invalid host configuration: {0}")]
    InvalidHost(String),

    /// The pool has been shut down.
    #[error("Connection pool is closed")]
    Closed,
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
