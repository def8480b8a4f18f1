//! Stream cache trait abstractions

use crate::cache::error::CacheResult;
use crate::cache::payload::Envelope;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Identifier of an entry inside a named stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryId {
    stream: String,
    id: String,
}

impl EntryId {
    pub fn new(stream: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            id: id.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Store-assigned id, unique within the stream
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.id)
    }
}

/// An envelope read back from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub envelope: Envelope,
}

/// Append-only, length-bounded stream log with consumer groups
#[async_trait]
pub trait StreamCache: Send + Sync {
    /// Append an envelope to `stream`, trimming the stream to roughly the
    /// configured cap
    async fn add(&self, stream: &str, topic: &str, payload: &[u8]) -> CacheResult<EntryId>;

    /// Create `group` on `stream`, creating the stream if absent. The group
    /// only sees entries appended after this call.
    async fn group_create(&self, stream: &str, group: &str) -> CacheResult<String>;

    /// Read undelivered entries for `group` across `streams`.
    ///
    /// With `block = None` the call waits until at least one entry is
    /// available. With `Some(timeout)` it returns an empty list once the
    /// timeout elapses. Returned entries stay pending for
    /// `(group, consumer)` until acknowledged.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        block: Option<Duration>,
    ) -> CacheResult<Vec<StreamEntry>>;

    /// Delete an entry from its stream. Removing a missing entry succeeds.
    async fn remove(&self, entry: &EntryId) -> CacheResult<()>;

    /// Clear an entry from the group's pending list
    async fn ack(&self, entry: &EntryId, group: &str) -> CacheResult<()>;

    /// Transfer entries pending longer than `min_idle` to `consumer`
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> CacheResult<Vec<StreamEntry>>;

    /// Current number of entries in `stream`
    async fn len(&self, stream: &str) -> CacheResult<usize>;
}

pub(crate) fn validate_add_args(stream: &str, topic: &str) -> CacheResult<()> {
    use crate::cache::error::CacheError;

    if stream.is_empty() {
        return Err(CacheError::InvalidStreamName);
    }
    if topic.is_empty() {
        return Err(CacheError::MissingTopic);
    }
    Ok(())
}

pub(crate) fn validate_group_args(stream: &str, group: &str) -> CacheResult<()> {
    use crate::cache::error::CacheError;

    if stream.is_empty() {
        return Err(CacheError::MissingStream);
    }
    if group.is_empty() {
        return Err(CacheError::MissingGroup);
    }
    Ok(())
}
