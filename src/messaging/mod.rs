//! Inbound message bus.
//!
//! The bus source subscribes once per distinct route filter and hands every
//! received message to the [`RouteRegistry`](crate::routes::RouteRegistry).

mod error;
mod nats;

pub use error::{BusError, BusResult};
pub use nats::NatsSource;

use bytes::Bytes;

/// A message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Subject the message was published on
    pub subject: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}
