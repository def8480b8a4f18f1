//! Error types for bus operations

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors raised by the message bus client
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
}

impl From<async_nats::ConnectError> for BusError {
    fn from(err: async_nats::ConnectError) -> Self {
        BusError::ConnectionFailed(format!("NATS connection failed: {}", err))
    }
}
