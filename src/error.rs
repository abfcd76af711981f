//! Error types for ptyhub

use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid session or server configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Session registry is full
    #[error("maximum sessions ({0}) reached")]
    CapacityExceeded(usize),

    /// PTY allocation or child exec failed
    #[error("failed to spawn session process: {0}")]
    SpawnFailed(String),

    /// No session with the given ID
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Session exists but is not in the running state
    #[error("session not running: {0}")]
    SessionNotRunning(String),

    /// Sentinel template rejected by validation
    #[error("invalid sentinel template: {0}")]
    InvalidSentinel(String),

    /// Operation aborted because the session shut down underneath it
    #[error("operation cancelled: session closed")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
