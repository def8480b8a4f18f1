//! Envelope codec for stream entries.
//!
//! An [`Envelope`] is flattened into two stream fields, `topic` and
//! `payload`, on append and rebuilt from the raw field map on read-back.

use crate::cache::error::{CacheError, CacheResult};
use redis::Value;
use std::collections::HashMap;

/// Stream field holding the source subject
pub const TOPIC_FIELD: &str = "topic";

/// Stream field holding the encoded body
pub const PAYLOAD_FIELD: &str = "payload";

/// Topic and payload pair moved through the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    payload: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.topic, self.payload)
    }
}

/// Flatten a topic/payload pair into stream fields
pub fn encode<'a>(topic: &'a str, payload: &'a [u8]) -> [(&'static str, &'a [u8]); 2] {
    [(TOPIC_FIELD, topic.as_bytes()), (PAYLOAD_FIELD, payload)]
}

/// Rebuild an envelope from the field map returned by the store
pub fn decode(fields: &HashMap<String, Value>) -> CacheResult<Envelope> {
    let topic = field_bytes(fields, TOPIC_FIELD)?;
    let topic = String::from_utf8(topic)
        .map_err(|e| CacheError::MalformedEntry(format!("topic is not UTF-8: {}", e)))?;
    // An empty upstream body is stored as an empty field and passes through.
    let payload = match fields.get(PAYLOAD_FIELD) {
        Some(_) => field_bytes(fields, PAYLOAD_FIELD)?,
        None => Vec::new(),
    };

    Ok(Envelope { topic, payload })
}

fn field_bytes(fields: &HashMap<String, Value>, name: &str) -> CacheResult<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| CacheError::MalformedEntry(format!("missing '{}' field", name)))?;

    redis::from_redis_value::<Vec<u8>>(value)
        .map_err(|e| CacheError::MalformedEntry(format!("field '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_map(fields: &[(&'static str, &[u8])]) -> HashMap<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Data(v.to_vec())))
            .collect()
    }

    #[test]
    fn test_encode_fields() {
        let fields = encode("temp", b"23.5");
        assert_eq!(fields[0], ("topic", b"temp".as_slice()));
        assert_eq!(fields[1], ("payload", b"23.5".as_slice()));
    }

    #[test]
    fn test_decode_fields() {
        let envelope = decode(&to_map(&encode("temp", b"23.5"))).unwrap();
        assert_eq!(envelope.topic(), "temp");
        assert_eq!(envelope.payload(), b"23.5");
    }

    #[test]
    fn test_empty_payload_passes_through() {
        let envelope = decode(&to_map(&encode("temp", b""))).unwrap();
        assert!(envelope.payload().is_empty());
    }

    #[test]
    fn test_missing_topic_is_malformed() {
        let mut map = HashMap::new();
        map.insert("payload".to_string(), Value::Data(b"1".to_vec()));

        let err = decode(&map).unwrap_err();
        assert!(matches!(err, CacheError::MalformedEntry(_)));
    }
}
