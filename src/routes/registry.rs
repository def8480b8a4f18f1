use crate::config::{BackpressurePolicy, Config};
use crate::messaging::BusMessage;
use crate::metrics::EXPORT_METRICS;
use crate::routes::error::{RouteError, RouteResult};
use crate::routes::route::{MessageSink, Route};
use crate::routes::subject;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc::error::TrySendError, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// All configured routes and the policy used to feed them
pub struct RouteRegistry {
    routes: Vec<Arc<Route>>,
    policy: BackpressurePolicy,
    /// Shutdown signal of the running workers, set by `consume_all`
    stop: Mutex<Option<watch::Receiver<bool>>>,
}

impl RouteRegistry {
    pub fn new(routes: Vec<Route>, policy: BackpressurePolicy) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
            policy,
            stop: Mutex::new(None),
        }
    }

    /// Build every route declared in the configuration.
    ///
    /// Fails on the first route with an unknown type.
    pub fn from_config(config: &Config) -> RouteResult<Self> {
        let routes = config
            .routes
            .iter()
            .map(|rc| Route::from_config(rc, &config.mqtt.channel, config.server.buffer_size))
            .collect::<RouteResult<Vec<_>>>()?;

        info!(routes = routes.len(), "Routes created");
        Ok(Self::new(routes, config.server.backpressure))
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Distinct subject filters to subscribe to, in route order
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let filter = route.filter();
            if !subjects.contains(&filter) {
                subjects.push(filter);
            }
        }
        subjects
    }

    /// Routes whose filter matches `subject`
    pub fn matching(&self, subject: &str) -> Vec<&Arc<Route>> {
        self.routes
            .iter()
            .filter(|route| subject::matches(&route.filter(), subject))
            .collect()
    }

    /// Hand a bus message to every matching route's buffer.
    ///
    /// Returns the number of routes that accepted it. A route whose buffer is
    /// closed is reported as an error after the other routes were served.
    /// Under the block policy a full buffer is waited on until the workers
    /// are told to stop; the message is then reported as
    /// [`RouteError::Stopped`].
    pub async fn dispatch(&self, message: BusMessage) -> RouteResult<usize> {
        let routes = self.matching(&message.subject);
        self.offer(&routes, message).await
    }

    /// Like [`RouteRegistry::dispatch`], restricted to routes subscribed
    /// through `filter`.
    ///
    /// Used by per-subject subscriptions so overlapping filters do not feed
    /// a route twice.
    pub async fn dispatch_filtered(&self, filter: &str, message: BusMessage) -> RouteResult<usize> {
        let routes: Vec<&Arc<Route>> = self
            .routes
            .iter()
            .filter(|route| route.filter() == filter)
            .collect();
        self.offer(&routes, message).await
    }

    async fn offer(&self, routes: &[&Arc<Route>], message: BusMessage) -> RouteResult<usize> {
        let mut accepted = 0;
        let mut failed = None;
        let stop = self.stop.lock().clone();

        for route in routes {
            EXPORT_METRICS
                .messages_received
                .with_label_values(&[route.name()])
                .inc();

            let buffer = route.messages_buffer();
            let sent = match self.policy {
                BackpressurePolicy::Block => {
                    let send = buffer.send(message.clone());
                    match stop.clone() {
                        Some(mut stop) => tokio::select! {
                            biased;
                            sent = send => sent.map_err(|_| RouteError::BufferClosed(route.name().to_string())),
                            _ = stop.wait_for(|stopped| *stopped) => {
                                debug!(route = %route.name(), subject = %message.subject, "Route stopped while waiting for buffer space");
                                EXPORT_METRICS
                                    .messages_dropped
                                    .with_label_values(&[route.name(), "shutdown"])
                                    .inc();
                                Err(RouteError::Stopped(route.name().to_string()))
                            }
                        },
                        None => send
                            .await
                            .map_err(|_| RouteError::BufferClosed(route.name().to_string())),
                    }
                }
                BackpressurePolicy::Drop => match buffer.try_send(message.clone()) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        debug!(route = %route.name(), subject = %message.subject, "Route buffer full, dropping message");
                        EXPORT_METRICS
                            .messages_dropped
                            .with_label_values(&[route.name(), "backpressure"])
                            .inc();
                        continue;
                    }
                    Err(TrySendError::Closed(_)) => {
                        Err(RouteError::BufferClosed(route.name().to_string()))
                    }
                },
            };

            match sent {
                Ok(()) => {
                    route.record_buffer_depth();
                    accepted += 1;
                }
                Err(e) => failed = Some(e),
            }
        }

        match failed {
            Some(e) => Err(e),
            None => Ok(accepted),
        }
    }

    /// Start the worker pools of every route
    pub fn consume_all(
        &self,
        sink: Arc<dyn MessageSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if self.routes.is_empty() {
            warn!("No routes configured");
        }
        *self.stop.lock() = Some(shutdown.clone());

        self.routes
            .iter()
            .flat_map(|route| route.consume(Arc::clone(&sink), shutdown.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use crate::routes::route::RouteKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn plain(nats_topic: &str, mqtt_topic: &str, buffer: usize) -> Route {
        Route::new(nats_topic, mqtt_topic, "", 1, RouteKind::Plain, "", buffer)
    }

    struct SelectiveSink {
        delivered: Mutex<Vec<String>>,
        fail_for: String,
    }

    #[async_trait]
    impl MessageSink for SelectiveSink {
        async fn deliver(&self, route: &Route, _source: &str, _payload: Vec<u8>) -> crate::Result<()> {
            if route.destination() == self.fail_for {
                return Err(crate::AppError::Internal("sink rejected".to_string()));
            }
            self.delivered.lock().push(route.destination().to_string());
            Ok(())
        }
    }

    #[test]
    fn test_unknown_route_type_rejected() {
        let mut config = Config::default();
        config.routes.push(RouteConfig {
            nats_topic: "channels.>".to_string(),
            mqtt_topic: "export".to_string(),
            route_type: "xml".to_string(),
            ..Default::default()
        });

        assert!(matches!(
            RouteRegistry::from_config(&config),
            Err(RouteError::UnknownType(_))
        ));
    }

    #[test]
    fn test_tail_wildcard_subtopic_rejected() {
        let mut config = Config::default();
        config.routes.push(RouteConfig {
            nats_topic: "channels.>".to_string(),
            mqtt_topic: "export".to_string(),
            subtopic: "temp".to_string(),
            ..Default::default()
        });

        assert!(matches!(
            RouteRegistry::from_config(&config),
            Err(RouteError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_subjects_are_distinct() {
        let registry = RouteRegistry::new(
            vec![plain("channels.>", "a", 4), plain("channels.>", "b", 4), plain("things.*", "c", 4)],
            BackpressurePolicy::Block,
        );

        assert_eq!(registry.subjects(), vec!["channels.>", "things.*"]);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_to_matching_routes() {
        let registry = RouteRegistry::new(
            vec![plain("channels.>", "a", 4), plain("channels.*", "b", 4), plain("other", "c", 4)],
            BackpressurePolicy::Block,
        );

        let accepted = registry
            .dispatch(BusMessage::new("channels.1.temp", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(accepted, 1);

        let accepted = registry
            .dispatch(BusMessage::new("channels.1", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn test_dispatch_filtered_skips_overlapping_filters() {
        let registry = RouteRegistry::new(
            vec![plain("channels.>", "a", 4), plain("channels.*", "b", 4)],
            BackpressurePolicy::Block,
        );

        let accepted = registry
            .dispatch_filtered("channels.*", BusMessage::new("channels.1", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_drop_policy_sheds_when_full() {
        let registry = RouteRegistry::new(vec![plain("s", "a", 1)], BackpressurePolicy::Drop);

        let first = registry
            .dispatch(BusMessage::new("s", Bytes::from_static(b"1")))
            .await
            .unwrap();
        let second = registry
            .dispatch(BusMessage::new("s", Bytes::from_static(b"2")))
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_failing_route_does_not_block_others() {
        let registry = RouteRegistry::new(
            vec![plain("s", "broken", 4), plain("s", "healthy", 4)],
            BackpressurePolicy::Block,
        );
        let sink = Arc::new(SelectiveSink {
            delivered: Mutex::new(Vec::new()),
            fail_for: "broken".to_string(),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = registry.consume_all(sink.clone(), stop_rx);

        for i in 0..3u8 {
            registry
                .dispatch(BusMessage::new("s", Bytes::from(vec![i])))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while sink.delivered.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(sink.delivered.lock().iter().all(|d| d == "healthy"));
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_buffer_space() {
        let registry = RouteRegistry::new(vec![plain("s", "a", 1)], BackpressurePolicy::Block);

        registry
            .dispatch(BusMessage::new("s", Bytes::from_static(b"1")))
            .await
            .unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            registry.dispatch(BusMessage::new("s", Bytes::from_static(b"2"))),
        )
        .await;
        assert!(blocked.is_err(), "dispatch into a full buffer returned early");

        let buffer = Arc::clone(&registry.routes()[0]);
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            buffer.next_message().await
        });

        let accepted = tokio::time::timeout(
            Duration::from_secs(1),
            registry.dispatch(BusMessage::new("s", Bytes::from_static(b"3"))),
        )
        .await
        .expect("dispatch did not resume after the buffer drained")
        .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(drain.await.unwrap().unwrap().payload, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_blocked_dispatch_returns_on_shutdown() {
        let registry = RouteRegistry::new(vec![plain("s", "a", 1)], BackpressurePolicy::Block);
        let sink = Arc::new(SelectiveSink {
            delivered: Mutex::new(Vec::new()),
            fail_for: String::new(),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = registry.consume_all(sink, stop_rx);

        stop_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        // Fills the buffer; no worker is left to drain it.
        registry
            .dispatch(BusMessage::new("s", Bytes::from_static(b"1")))
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            registry.dispatch(BusMessage::new("s", Bytes::from_static(b"2"))),
        )
        .await
        .expect("dispatch into a full buffer ignored shutdown");
        assert!(matches!(result, Err(RouteError::Stopped(_))));
    }

    #[tokio::test]
    async fn test_buffer_depth_tracks_enqueued_messages() {
        let registry = RouteRegistry::new(vec![plain("s", "depth", 4)], BackpressurePolicy::Block);
        let depth = || {
            EXPORT_METRICS
                .buffer_depth
                .with_label_values(&["s->depth"])
                .get()
        };

        for i in 0..2u8 {
            registry
                .dispatch(BusMessage::new("s", Bytes::from(vec![i])))
                .await
                .unwrap();
        }
        assert_eq!(depth(), 2);

        registry.routes()[0].next_message().await.unwrap();
        assert_eq!(depth(), 1);
    }
}
