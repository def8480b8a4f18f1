//! Structured telemetry transform.
//!
//! Bus messages are protobuf frames carrying a content type and a SenML
//! payload. The payload is decoded according to the content type and
//! re-encoded as SenML JSON.

use crate::routes::error::RouteResult;
use crate::routes::senml::{self, Format};
use prost::Message;

/// SenML in JSON format content type
pub const CONTENT_TYPE_JSON: &str = "application/senml+json";

/// SenML in CBOR format content type
pub const CONTENT_TYPE_CBOR: &str = "application/senml+cbor";

const FORMATS: &[(&str, Format)] = &[
    (CONTENT_TYPE_JSON, Format::Json),
    (CONTENT_TYPE_CBOR, Format::Cbor),
];

/// Wire frame published on the bus by telemetry adapters
#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub subtopic: String,
    #[prost(string, tag = "3")]
    pub publisher: String,
    #[prost(string, tag = "4")]
    pub protocol: String,
    #[prost(string, tag = "5")]
    pub content_type: String,
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
}

/// Map a content type to its SenML format, defaulting to JSON
pub fn format_for(content_type: &str) -> Format {
    FORMATS
        .iter()
        .find(|(ct, _)| *ct == content_type)
        .map(|(_, format)| *format)
        .unwrap_or(Format::Json)
}

/// Decode a frame and re-encode its payload as SenML JSON
pub fn transform(data: &[u8]) -> RouteResult<Vec<u8>> {
    let frame = Frame::decode(data)?;
    let records = senml::decode(&frame.payload, format_for(&frame.content_type))?;
    senml::encode_json(&records)
}
