use crate::config::RouteConfig;
use crate::messaging::BusMessage;
use crate::metrics::EXPORT_METRICS;
use crate::routes::error::{RouteError, RouteResult};
use crate::routes::{mfx, subject};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transform applied by a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Forward the bus payload unchanged
    Plain,
    /// Decode framed SenML and re-encode it as SenML JSON
    Mfx,
}

impl FromStr for RouteKind {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "plain" | "default" => Ok(RouteKind::Plain),
            "mfx" => Ok(RouteKind::Mfx),
            other => Err(RouteError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Idle,
    Consuming,
}

/// Receives the output of a route's workers
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver a processed payload that originated from `source_subject`
    async fn deliver(
        &self,
        route: &Route,
        source_subject: &str,
        payload: Vec<u8>,
    ) -> crate::Result<()>;
}

/// Binding from a bus subject pattern to a downstream topic, with its own
/// buffer and worker pool.
///
/// Routes never subscribe to the bus themselves; the dispatcher pushes into
/// [`Route::messages_buffer`].
pub struct Route {
    name: String,
    nats_topic: String,
    mqtt_topic: String,
    subtopic: String,
    destination: String,
    workers: usize,
    kind: RouteKind,
    tx: mpsc::Sender<BusMessage>,
    rx: Arc<Mutex<mpsc::Receiver<BusMessage>>>,
    consuming: AtomicBool,
}

impl Route {
    /// Create a new route
    pub fn new(
        nats_topic: &str,
        mqtt_topic: &str,
        subtopic: &str,
        workers: usize,
        kind: RouteKind,
        channel: &str,
        buffer_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let destination = destination_topic(channel, mqtt_topic, subtopic);

        Self {
            name: format!("{}->{}", subject::route_filter(nats_topic, subtopic), destination),
            nats_topic: nats_topic.to_string(),
            mqtt_topic: mqtt_topic.to_string(),
            subtopic: subtopic.to_string(),
            destination,
            workers: workers.max(1),
            kind,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            consuming: AtomicBool::new(false),
        }
    }

    /// Create a route from its configuration entry
    pub fn from_config(config: &RouteConfig, channel: &str, buffer_size: usize) -> RouteResult<Self> {
        let kind = config.route_type.parse()?;
        subject::check_filter(&subject::route_filter(&config.nats_topic, &config.subtopic))
            .map_err(RouteError::InvalidFilter)?;
        Ok(Self::new(
            &config.nats_topic,
            &config.mqtt_topic,
            &config.subtopic,
            config.workers,
            kind,
            channel,
            buffer_size,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared worker count
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn nats_topic(&self) -> &str {
        &self.nats_topic
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn subtopic(&self) -> &str {
        &self.subtopic
    }

    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    /// Bus subject filter, narrowed by the subtopic
    pub fn filter(&self) -> String {
        subject::route_filter(&self.nats_topic, &self.subtopic)
    }

    /// Fully qualified downstream topic
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn state(&self) -> RouteState {
        if self.consuming.load(Ordering::Acquire) {
            RouteState::Consuming
        } else {
            RouteState::Idle
        }
    }

    /// Inbound queue the dispatcher feeds
    pub fn messages_buffer(&self) -> mpsc::Sender<BusMessage> {
        self.tx.clone()
    }

    /// Transform one bus payload into its downstream representation.
    ///
    /// Either the whole output is produced or an error is returned.
    pub fn process(&self, data: &[u8]) -> RouteResult<Vec<u8>> {
        match self.kind {
            RouteKind::Plain => Ok(data.to_vec()),
            RouteKind::Mfx => mfx::transform(data),
        }
    }

    /// Start `workers()` drain loops on the buffer.
    ///
    /// Only the first call spawns workers; later calls return no handles.
    pub fn consume(
        self: &Arc<Self>,
        sink: Arc<dyn MessageSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if self.consuming.swap(true, Ordering::AcqRel) {
            warn!(route = %self.name, "Route is already consuming");
            return Vec::new();
        }

        info!(route = %self.name, workers = self.workers, "Route consuming");

        (0..self.workers)
            .map(|worker_id| {
                let route = Arc::clone(self);
                let sink = Arc::clone(&sink);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { route.run_worker(worker_id, sink, shutdown).await })
            })
            .collect()
    }

    /// Publish the current number of queued messages
    pub(crate) fn record_buffer_depth(&self) {
        EXPORT_METRICS
            .buffer_depth
            .with_label_values(&[&self.name])
            .set((self.tx.max_capacity() - self.tx.capacity()) as i64);
    }

    pub(crate) async fn next_message(&self) -> Option<BusMessage> {
        let message = self.rx.lock().await.recv().await;
        self.record_buffer_depth();
        message
    }

    async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        sink: Arc<dyn MessageSink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(route = %self.name, worker_id, "Route worker started");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                message = self.next_message() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            self.handle(message, sink.as_ref()).await;
        }

        debug!(route = %self.name, worker_id, "Route worker stopped");
    }

    async fn handle(&self, message: BusMessage, sink: &dyn MessageSink) {
        let payload = match self.process(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(route = %self.name, subject = %message.subject, error = %e, "Dropping message that failed to process");
                EXPORT_METRICS
                    .messages_dropped
                    .with_label_values(&[&self.name, "decode"])
                    .inc();
                return;
            }
        };

        EXPORT_METRICS
            .messages_processed
            .with_label_values(&[&self.name])
            .inc();

        if let Err(e) = sink.deliver(self, &message.subject, payload).await {
            warn!(route = %self.name, subject = %message.subject, error = %e, "Message delivery failed");
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Downstream topic for a route
pub fn destination_topic(channel: &str, mqtt_topic: &str, subtopic: &str) -> String {
    let base = if channel.is_empty() {
        mqtt_topic.to_string()
    } else {
        format!("channels/{}/messages/{}", channel, mqtt_topic)
    };

    if subtopic.is_empty() {
        base
    } else {
        format!("{}/{}", base, subtopic)
    }
}
