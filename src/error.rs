//! Error types for term-relay.

use thiserror::Error;

/// Main error type for term-relay operations.
#[derive(Error, Debug)]
pub enum TermRelayError {
    /// Session with the given ID was not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Owner already holds the maximum number of live sessions.
    #[error("session quota exceeded for owner {owner}: limit is {limit}")]
    QuotaExceeded { owner: String, limit: usize },

    /// Script path escapes the configured base directory.
    #[error("script path rejected: {0}")]
    PathTraversalRejected(String),

    /// Local process could not be spawned.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Remote connection could not be established.
    #[error("remote connection failed: {0}")]
    ConnectionFailed(String),

    /// Interactive channel could not be opened on an established connection.
    #[error("failed to open remote shell channel: {0}")]
    ChannelOpenFailed(String),

    /// Caller is not the owner of the session.
    #[error("access denied: session {session} is not owned by {owner}")]
    AccessDenied { session: String, owner: String },

    /// Operation requires a session in CONNECTED status.
    #[error("session {session} is not connected: current status is {status:?}")]
    NotConnected {
        session: String,
        status: crate::session::SessionStatus,
    },

    /// Backend input sink is closed.
    #[error("write failed: backend input closed")]
    WriteFailed,

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::session::SessionStatus,
        to: crate::session::SessionStatus,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

/// Convenience Result type for term-relay operations.
pub type Result<T> = std::result::Result<T, TermRelayError>;
