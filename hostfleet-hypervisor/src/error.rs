//! Error types for the hypervisor client layer.

use thiserror::Error;

/// Errors that can occur while talking to a hypervisor host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The connection did not come up within the configured timeout.
    #[error("Timed out after {0}s connecting to hypervisor")]
    Timeout(u64),

    /// A liveness probe against an open connection failed.
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Releasing the connection failed.
    #[error("Failed to close connection: {0}")]
    CloseFailed(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
