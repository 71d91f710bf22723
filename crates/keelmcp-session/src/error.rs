//! Session layer error types.

use crate::id::SessionId;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by the session store and its backends
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The id is not a 22-character base62 token
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// No live or persisted session with this id
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session was closed or evicted
    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    /// A persisted record could not be read or written
    #[error("storage error: {0}")]
    Storage(String),

    /// Underlying filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record did not deserialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Shorthand for a storage error.
    pub fn storage(detail: impl Into<String>) -> Self {
        Self::Storage(detail.into())
    }
}
