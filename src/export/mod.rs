//! Delivery of processed messages to the downstream broker.
//!
//! [`Delivery`] is the sink route workers hand their output to. Depending on
//! the configured mode it publishes directly, stages the message in the
//! route's stream, or publishes and stages only on failure. [`Redelivery`]
//! drains the streams through a consumer group and removes an entry only
//! after the broker confirmed it.

mod delivery;
mod redelivery;
mod service;

pub use delivery::Delivery;
pub use redelivery::Redelivery;
pub use service::ExportService;

use std::time::Duration;

const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Backoff before retrying after `attempts` consecutive store failures
pub(crate) fn backoff(attempts: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempts.saturating_sub(1));
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

/// Name of the stream staging messages for `destination`
pub fn stream_name(prefix: &str, destination: &str) -> String {
    format!("{}{}", prefix, destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name("export:", "channels/c/messages/m"), "export:channels/c/messages/m");
        assert_eq!(stream_name("", "m"), "m");
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(3), Duration::from_millis(400));
        assert_eq!(backoff(40), Duration::from_millis(MAX_BACKOFF_MS));
    }
}
