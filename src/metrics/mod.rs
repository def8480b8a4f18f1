//! Prometheus metrics for the export bridge
//!
//! Every dropped or undeliverable message increments a counter here, so a
//! message is never lost without a countable signal.

mod server;

pub use server::{build_metrics_router, serve_metrics};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_gauge_vec, register_histogram_vec, CounterVec,
    HistogramVec, IntGaugeVec,
};

/// Export bridge metrics
pub struct ExportMetrics {
    /// Bus messages accepted into a route buffer
    pub messages_received: CounterVec,

    /// Messages discarded before delivery
    pub messages_dropped: CounterVec,

    /// Messages transformed successfully
    pub messages_processed: CounterVec,

    /// Successful downstream publishes
    pub messages_published: CounterVec,

    /// Failed downstream publishes
    pub publish_failures: CounterVec,

    /// Stream cache operations by outcome
    pub cache_operations: CounterVec,

    /// Entries delivered by the redelivery loop
    pub messages_redelivered: CounterVec,

    /// Route buffer occupancy
    pub buffer_depth: IntGaugeVec,

    /// Downstream publish latency
    pub publish_latency: HistogramVec,
}

lazy_static! {
    pub static ref EXPORT_METRICS: ExportMetrics = ExportMetrics {
        messages_received: register_counter_vec!(
            "export_messages_received_total",
            "Total number of bus messages accepted by a route",
            &["route"]
        )
        .unwrap(),

        messages_dropped: register_counter_vec!(
            "export_messages_dropped_total",
            "Total number of messages dropped before delivery",
            &["route", "reason"]
        )
        .unwrap(),

        messages_processed: register_counter_vec!(
            "export_messages_processed_total",
            "Total number of messages transformed by a route",
            &["route"]
        )
        .unwrap(),

        messages_published: register_counter_vec!(
            "export_messages_published_total",
            "Total number of messages published downstream",
            &["topic"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "export_publish_failures_total",
            "Total number of failed downstream publishes",
            &["topic"]
        )
        .unwrap(),

        cache_operations: register_counter_vec!(
            "export_cache_operations_total",
            "Total number of stream cache operations",
            &["operation", "result"]
        )
        .unwrap(),

        messages_redelivered: register_counter_vec!(
            "export_messages_redelivered_total",
            "Total number of cached entries delivered and acknowledged",
            &["stream"]
        )
        .unwrap(),

        buffer_depth: register_int_gauge_vec!(
            "export_route_buffer_depth",
            "Number of messages waiting in a route buffer",
            &["route"]
        )
        .unwrap(),

        publish_latency: register_histogram_vec!(
            "export_publish_latency_seconds",
            "Downstream publish latency in seconds",
            &["topic"]
        )
        .unwrap(),
    };
}

/// Initialize export metrics
pub fn init_metrics() {
    lazy_static::initialize(&EXPORT_METRICS);
}

/// Render all registered metrics in the text exposition format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
