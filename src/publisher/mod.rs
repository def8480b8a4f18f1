//! Downstream publishing.
//!
//! [`Publisher`] is the seam between delivery and the downstream broker.
//! [`MqttPublisher`] implements it over MQTT and only reports success once
//! the broker confirmed the message at the requested QoS.

mod mqtt;

pub use mqtt::{broker_address, MqttPublisher, DEFAULT_PUBLISH_TIMEOUT};

use async_trait::async_trait;

/// Result type for publish operations
pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// Errors raised by a downstream publisher
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// Broker connection could not be set up or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker rejected or failed the publish
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Certificate material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// No confirmation arrived in time
    #[error("Publish timed out after {0} ms")]
    Timeout(u64),
}

/// Sends a payload to a downstream topic
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`.
    ///
    /// `Ok` means the broker accepted the message; on `Err` the caller must
    /// assume it was not delivered.
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> PublishResult<()>;
}
