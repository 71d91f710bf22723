//! Transport error types.

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors a transport may surface to the engine
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The peer closed the channel
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be delivered
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A frame could not be read
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the channel is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}
