use crate::cache::{CacheError, CacheErrorKind, EntryId, StreamCache};
use crate::config::{Config, DeliveryMode};
use crate::error::Result;
use crate::export::{backoff, stream_name};
use crate::metrics::EXPORT_METRICS;
use crate::publisher::{PublishResult, Publisher};
use crate::routes::{MessageSink, Route};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Attempts to append a message to its stream before it is counted as lost
pub const STAGE_ATTEMPTS: u32 = 4;

/// Publish and record latency and outcome
pub(crate) async fn publish_measured(
    publisher: &dyn Publisher,
    topic: &str,
    payload: &[u8],
    qos: u8,
    retain: bool,
) -> PublishResult<()> {
    let started = Instant::now();
    let result = publisher.publish(topic, payload, qos, retain).await;

    EXPORT_METRICS
        .publish_latency
        .with_label_values(&[topic])
        .observe(started.elapsed().as_secs_f64());

    match &result {
        Ok(()) => EXPORT_METRICS
            .messages_published
            .with_label_values(&[topic])
            .inc(),
        Err(_) => EXPORT_METRICS
            .publish_failures
            .with_label_values(&[topic])
            .inc(),
    }

    result
}

/// Sink that hands processed messages to the broker or the stream cache
pub struct Delivery {
    mode: DeliveryMode,
    cache: Arc<dyn StreamCache>,
    publisher: Arc<dyn Publisher>,
    stream_prefix: String,
    qos: u8,
    retain: bool,
    /// Cuts staging retries short once set
    shutdown: watch::Receiver<bool>,
}

impl Delivery {
    pub fn new(
        mode: DeliveryMode,
        cache: Arc<dyn StreamCache>,
        publisher: Arc<dyn Publisher>,
        stream_prefix: impl Into<String>,
        qos: u8,
        retain: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            mode,
            cache,
            publisher,
            stream_prefix: stream_prefix.into(),
            qos,
            retain,
            shutdown,
        }
    }

    pub fn from_config(
        config: &Config,
        cache: Arc<dyn StreamCache>,
        publisher: Arc<dyn Publisher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self::new(
            config.server.delivery,
            cache,
            publisher,
            config.cache.stream_prefix.clone(),
            config.mqtt.qos,
            config.mqtt.retain,
            shutdown,
        )
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Append to the route's stream, retrying store failures with backoff.
    ///
    /// After `STAGE_ATTEMPTS` failures, a validation error or a shutdown the
    /// message is counted as dropped and the last error returned.
    async fn stage(&self, route: &Route, source_subject: &str, payload: &[u8]) -> Result<EntryId> {
        let stream = stream_name(&self.stream_prefix, route.destination());
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.cache.add(&stream, source_subject, payload).await {
                Ok(entry) => {
                    debug!(route = %route.name(), entry = %entry, attempt, "Message staged");
                    return Ok(entry);
                }
                Err(e) => e,
            };

            if attempt >= STAGE_ATTEMPTS || err.kind() != CacheErrorKind::Store {
                return Err(Self::lost(route, &stream, attempt, err));
            }

            let delay = backoff(attempt);
            warn!(route = %route.name(), stream = %stream, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Staging failed, retrying");

            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    return Err(Self::lost(route, &stream, attempt, err));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn lost(route: &Route, stream: &str, attempts: u32, err: CacheError) -> crate::AppError {
        error!(route = %route.name(), stream = %stream, attempts, error = %err, "Failed to stage message, message lost");
        EXPORT_METRICS
            .messages_dropped
            .with_label_values(&[route.name(), "store"])
            .inc();
        err.into()
    }
}

#[async_trait]
impl MessageSink for Delivery {
    async fn deliver(&self, route: &Route, source_subject: &str, payload: Vec<u8>) -> Result<()> {
        let topic = route.destination();

        match self.mode {
            DeliveryMode::Cached => {
                self.stage(route, source_subject, &payload).await?;
            }
            DeliveryMode::Direct => {
                publish_measured(self.publisher.as_ref(), topic, &payload, self.qos, self.retain)
                    .await?;
            }
            DeliveryMode::Fallback => {
                if let Err(e) =
                    publish_measured(self.publisher.as_ref(), topic, &payload, self.qos, self.retain)
                        .await
                {
                    warn!(route = %route.name(), topic, error = %e, "Publish failed, staging for redelivery");
                    self.stage(route, source_subject, &payload).await?;
                }
            }
        }

        Ok(())
    }
}
