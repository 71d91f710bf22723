//! Server error types.

use keelmcp_protocol::ProtocolError;
use keelmcp_session::SessionError;
use keelmcp_transport::TransportError;

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by the engine and registry
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session layer error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Transport layer error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handler registration error
    #[error("handler error: {message}")]
    Handler {
        /// Error message
        message: String,
        /// Method being registered
        method: Option<String>,
    },

    /// Engine lifecycle error
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ServerError {
    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            method: None,
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }
}
