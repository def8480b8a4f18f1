//! Routes bind bus subjects to downstream topics.
//!
//! Each route owns a bounded buffer and a pool of workers. The
//! [`RouteRegistry`] fans bus messages out to every matching route; the
//! workers transform payloads and hand them to a [`MessageSink`].

mod error;
pub mod mfx;
mod registry;
mod route;
pub mod senml;
pub mod subject;

pub use error::{RouteError, RouteResult};
pub use registry::RouteRegistry;
pub use route::{destination_topic, MessageSink, Route, RouteKind, RouteState};
