//! Error types for route operations

/// Result type for route operations
pub type RouteResult<T> = std::result::Result<T, RouteError>;

/// Errors that can occur while routing or transforming a message
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Framing or payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Canonical output could not be produced
    #[error("Encode error: {0}")]
    Encode(String),

    /// Route type in configuration is not known
    #[error("Unknown route type: {0}")]
    UnknownType(String),

    /// Subject filter built from configuration is not a valid pattern
    #[error("Invalid route filter: {0}")]
    InvalidFilter(String),

    /// Route workers stopped before the message could be buffered
    #[error("Route stopped: {0}")]
    Stopped(String),

    /// Route buffer no longer accepts messages
    #[error("Route buffer closed: {0}")]
    BufferClosed(String),
}

impl From<prost::DecodeError> for RouteError {
    fn from(err: prost::DecodeError) -> Self {
        RouteError::Decode(format!("invalid message framing: {}", err))
    }
}
