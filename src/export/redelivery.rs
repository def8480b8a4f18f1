use crate::cache::{CacheError, CacheResult, StreamCache, StreamEntry};
use crate::config::Config;
use crate::error::Result;
use crate::export::delivery::publish_measured;
use crate::export::{backoff, stream_name};
use crate::metrics::EXPORT_METRICS;
use crate::publisher::Publisher;
use crate::routes::RouteRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consumer-group loop publishing staged entries
pub struct Redelivery {
    cache: Arc<dyn StreamCache>,
    publisher: Arc<dyn Publisher>,
    /// stream -> destination topic
    destinations: HashMap<String, String>,
    streams: Vec<String>,
    group: String,
    consumer: String,
    claim_idle: Duration,
    read_block: Duration,
    qos: u8,
    retain: bool,
}

impl Redelivery {
    pub fn new(
        config: &Config,
        registry: &RouteRegistry,
        cache: Arc<dyn StreamCache>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let mut destinations = HashMap::new();
        let mut streams = Vec::new();
        for route in registry.routes() {
            let stream = stream_name(&config.cache.stream_prefix, route.destination());
            if destinations
                .insert(stream.clone(), route.destination().to_string())
                .is_none()
            {
                streams.push(stream);
            }
        }

        Self {
            cache,
            publisher,
            destinations,
            streams,
            group: config.cache.group.clone(),
            consumer: config.cache.consumer.clone(),
            claim_idle: Duration::from_millis(config.cache.claim_idle_ms),
            read_block: Duration::from_millis(config.cache.read_block_ms),
            qos: config.mqtt.qos,
            retain: config.mqtt.retain,
        }
    }

    /// Streams read by this loop
    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Create the consumer group on every route stream.
    ///
    /// An existing group is fine; any other store error is returned.
    pub async fn create_groups(&self) -> Result<()> {
        for stream in &self.streams {
            match self.cache.group_create(stream, &self.group).await {
                Ok(_) => info!(stream = %stream, group = %self.group, "Consumer group created"),
                Err(CacheError::GroupAlreadyExists) => {
                    debug!(stream = %stream, group = %self.group, "Consumer group exists")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read one batch of new entries and deliver it.
    ///
    /// Returns the number of entries delivered. Entries whose publish failed
    /// stay pending for re-claim.
    pub async fn poll_once(&self) -> CacheResult<usize> {
        let entries = self
            .cache
            .read_group(&self.streams, &self.group, &self.consumer, Some(self.read_block))
            .await?;
        self.deliver_all(entries).await
    }

    /// Re-claim entries left pending longer than the idle threshold and
    /// deliver them
    pub async fn reclaim(&self) -> CacheResult<usize> {
        let mut delivered = 0;
        for stream in &self.streams {
            let entries = self
                .cache
                .claim_pending(stream, &self.group, &self.consumer, self.claim_idle)
                .await?;
            if !entries.is_empty() {
                debug!(stream = %stream, count = entries.len(), "Re-claimed pending entries");
            }
            delivered += self.deliver_all(entries).await?;
        }
        Ok(delivered)
    }

    /// Run until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.streams.is_empty() {
            info!("No streams to redeliver");
            let _ = shutdown.wait_for(|stop| *stop).await;
            return;
        }

        info!(streams = self.streams.len(), group = %self.group, consumer = %self.consumer, "Redelivery loop started");

        let mut failures = 0u32;
        let mut last_claim = Instant::now();

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                result = self.poll_once() => result,
            };

            let result = match result {
                Ok(_) if last_claim.elapsed() >= self.claim_idle => {
                    last_claim = Instant::now();
                    self.reclaim().await
                }
                other => other,
            };

            match result {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff(failures);
                    warn!(error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "Redelivery store error, backing off");

                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Redelivery loop stopped");
    }

    async fn deliver_all(&self, entries: Vec<StreamEntry>) -> CacheResult<usize> {
        let mut delivered = 0;
        for entry in entries {
            if self.redeliver(entry).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn redeliver(&self, entry: StreamEntry) -> CacheResult<bool> {
        let stream = entry.id.stream();
        let Some(topic) = self.destinations.get(stream) else {
            error!(entry = %entry.id, "Entry read from an unknown stream");
            return Ok(false);
        };

        if let Err(e) = publish_measured(
            self.publisher.as_ref(),
            topic,
            entry.envelope.payload(),
            self.qos,
            self.retain,
        )
        .await
        {
            warn!(entry = %entry.id, source = %entry.envelope.topic(), error = %e, "Redelivery failed, entry stays pending");
            return Ok(false);
        }

        self.cache.ack(&entry.id, &self.group).await?;
        self.cache.remove(&entry.id).await?;
        debug!(entry = %entry.id, topic = %topic, "Entry redelivered");

        EXPORT_METRICS
            .messages_redelivered
            .with_label_values(&[stream])
            .inc();
        Ok(true)
    }
}
