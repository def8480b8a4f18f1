use crate::cache::{RedisStreamCache, StreamCache};
use crate::config::{Config, DeliveryMode};
use crate::error::Result;
use crate::export::{Delivery, Redelivery};
use crate::messaging::NatsSource;
use crate::metrics::serve_metrics;
use crate::publisher::{MqttPublisher, Publisher};
use crate::routes::{MessageSink, RouteRegistry};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Wires routes, stream cache, publisher and bus together
pub struct ExportService {
    config: Config,
    cache: Arc<dyn StreamCache>,
    publisher: Arc<dyn Publisher>,
    registry: Arc<RouteRegistry>,
}

impl ExportService {
    /// Build the service on top of existing cache and publisher
    pub fn new(
        config: Config,
        cache: Arc<dyn StreamCache>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let registry = Arc::new(RouteRegistry::from_config(&config)?);
        Ok(Self {
            config,
            cache,
            publisher,
            registry,
        })
    }

    /// Connect to Redis and the MQTT broker
    pub async fn connect(config: Config, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let url = RedisStreamCache::url(
            &config.server.cache_url,
            &config.server.cache_pass,
            &config.server.cache_db,
        );
        let cache = RedisStreamCache::new(&url, config.cache.stream_len).await?;
        info!(address = %config.server.cache_url, db = %config.server.cache_db, "Connected to Redis");

        let publisher = MqttPublisher::new(&config.mqtt, shutdown)?;
        info!(host = %config.mqtt.host, "MQTT publisher started");

        Self::new(config, Arc::new(cache), Arc::new(publisher))
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn delivery(&self, shutdown: watch::Receiver<bool>) -> Delivery {
        Delivery::from_config(
            &self.config,
            Arc::clone(&self.cache),
            Arc::clone(&self.publisher),
            shutdown,
        )
    }

    pub fn redelivery(&self) -> Redelivery {
        Redelivery::new(
            &self.config,
            &self.registry,
            Arc::clone(&self.cache),
            Arc::clone(&self.publisher),
        )
    }

    /// Create consumer groups and start route workers and the redelivery
    /// loop. Bus subscriptions are not part of this.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        if self.config.server.delivery != DeliveryMode::Direct {
            let redelivery = self.redelivery();
            redelivery.create_groups().await?;

            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { redelivery.run(shutdown).await }));
        }

        let sink: Arc<dyn MessageSink> = Arc::new(self.delivery(shutdown.clone()));
        handles.extend(self.registry.consume_all(sink, shutdown));

        info!(
            routes = self.registry.routes().len(),
            delivery = ?self.config.server.delivery,
            "Export service started"
        );
        Ok(handles)
    }

    /// Run everything until `shutdown` flips to true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut handles = self.start(shutdown.clone()).await?;

        let source = NatsSource::connect(&self.config.server.nats_url).await?;
        handles.extend(
            source
                .subscribe_all(Arc::clone(&self.registry), shutdown.clone())
                .await?,
        );

        let addr = format!("0.0.0.0:{}", self.config.server.port);
        let metrics_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = serve_metrics(&addr, metrics_shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        }));

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Task failed");
            }
        }

        if let Err(e) = source.flush().await {
            error!(error = %e, "Failed to flush bus connection");
        }

        info!("Export service stopped");
        Ok(())
    }
}
