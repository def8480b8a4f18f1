//! Telemetry export bridge.
//!
//! Moves messages published on a NATS bus to an MQTT broker with
//! at-least-once delivery. Inbound messages are matched to routes, transformed
//! by per-route worker pools and staged in Redis streams until the downstream
//! broker confirms delivery.
//!
//! ```text
//! NATS ──► Dispatcher ──► Route buffer ──► workers (Process)
//!                                              │
//!                          ┌───────────────────┴──────────────┐
//!                          ▼                                  ▼
//!                   StreamCache::add                  Publisher::publish
//!                          │
//!                          ▼
//!           Redelivery loop (read_group ► publish ► ack/remove)
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod messaging;
pub mod metrics;
pub mod publisher;
pub mod routes;

pub use error::{AppError, Result};
