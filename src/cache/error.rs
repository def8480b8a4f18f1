//! Error types for stream cache operations

/// Result type for stream cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during stream cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Append attempted without a stream name
    #[error("Invalid stream name: stream must not be empty")]
    InvalidStreamName,

    /// Append attempted without a source topic
    #[error("Invalid topic: topic must not be empty")]
    MissingTopic,

    /// Group creation attempted without a stream name
    #[error("Group not created, stream not being set")]
    MissingStream,

    /// Group creation attempted without a group name
    #[error("Group not created, group not being set")]
    MissingGroup,

    /// Group is already registered on the stream
    #[error("Consumer group already exists")]
    GroupAlreadyExists,

    /// Read attempted through a group that was never created
    #[error("No consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    /// Stored fields could not be decoded into an envelope
    #[error("Malformed stream entry: {0}")]
    MalformedEntry(String),

    /// Backing store failure
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Coarse classification of cache errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// Malformed arguments, rejected before any I/O
    Validation,
    /// Group already present
    AlreadyExists,
    /// Entry fields did not decode
    Malformed,
    /// Connectivity or command failure in the backing store
    Store,
}

impl CacheError {
    /// Classify this error
    pub fn kind(&self) -> CacheErrorKind {
        match self {
            CacheError::InvalidStreamName
            | CacheError::MissingTopic
            | CacheError::MissingStream
            | CacheError::MissingGroup => CacheErrorKind::Validation,
            CacheError::GroupAlreadyExists => CacheErrorKind::AlreadyExists,
            CacheError::MalformedEntry(_) => CacheErrorKind::Malformed,
            CacheError::NoGroup { .. } | CacheError::Redis(_) => CacheErrorKind::Store,
        }
    }
}
