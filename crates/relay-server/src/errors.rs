//! Error types for the hub and the server.

use thiserror::Error;

/// Errors returned by [`HubHandle`](crate::hub::HubHandle) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub task has exited; no further commands are accepted.
    #[error("hub is not running")]
    Stopped,
}

/// Errors from starting or running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// I/O failure on an already-bound listener.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// `listen` was called more than once.
    #[error("server is already listening")]
    AlreadyListening,
}
