//! Durable stream cache.
//!
//! Decouples ingestion from delivery: processed messages are appended to a
//! capped, per-route stream and read back through a consumer group by the
//! redelivery loop. An entry is deleted only after the downstream broker
//! confirmed delivery, so a crash or broker outage leaves it eligible for
//! re-claim.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_export::cache::{RedisStreamCache, StreamCache};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = RedisStreamCache::new("redis://localhost:6379/0", 1000).await?;
//!
//!     cache.group_create("events", "g1").await.ok();
//!     let id = cache.add("events", "temp", b"23.5").await?;
//!
//!     let streams = vec!["events".to_string()];
//!     for entry in cache.read_group(&streams, "g1", "c1", None).await? {
//!         println!("{} -> {:?}", entry.envelope.topic(), entry.envelope.payload());
//!         cache.remove(&entry.id).await?;
//!     }
//!     # let _ = id;
//!     Ok(())
//! }
//! ```

mod error;
mod memory;
mod payload;
mod redis_stream;
mod traits;

pub use error::{CacheError, CacheErrorKind, CacheResult};
pub use memory::MemoryStreamCache;
pub use payload::{decode, encode, Envelope, PAYLOAD_FIELD, TOPIC_FIELD};
pub use redis_stream::{RedisStreamCache, DEFAULT_STREAM_LEN};
pub use traits::{EntryId, StreamCache, StreamEntry};
