//! NATS bus source

use crate::messaging::error::{BusError, BusResult};
use crate::messaging::BusMessage;
use crate::routes::RouteRegistry;
use async_nats::Client;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Client name announced to the server
pub const CONNECTION_NAME: &str = "telemetry-export";

/// NATS subscriber feeding the route registry
pub struct NatsSource {
    client: Client,
}

impl NatsSource {
    /// Connect to the NATS server at `url`
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(CONNECTION_NAME)
            .connect(url)
            .await?;

        info!(url, "Connected to NATS");
        Ok(Self { client })
    }

    /// Subscribe to every distinct route filter.
    ///
    /// One task is spawned per subscription. Tasks end when `shutdown` flips
    /// to `true` or the subscription closes.
    pub async fn subscribe_all(
        &self,
        registry: Arc<RouteRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> BusResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for filter in registry.subjects() {
            let mut subscriber = self
                .client
                .subscribe(filter.clone())
                .await
                .map_err(|e| BusError::SubscribeFailed(format!("{}: {}", filter, e)))?;

            info!(subject = %filter, "Subscribed");

            let registry = Arc::clone(&registry);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        msg = subscriber.next() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };

                    let message = BusMessage::new(msg.subject.to_string(), msg.payload);
                    let dispatched = tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        dispatched = registry.dispatch_filtered(&filter, message) => dispatched,
                    };
                    if let Err(e) = dispatched {
                        error!(subject = %filter, error = %e, "Failed to dispatch message");
                    }
                }

                if let Err(e) = subscriber.unsubscribe().await {
                    debug!(subject = %filter, error = %e, "Unsubscribe failed");
                }
                debug!(subject = %filter, "Subscription closed");
            }));
        }

        Ok(handles)
    }

    /// Flush pending outbound traffic to the server
    pub async fn flush(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::ConnectionFailed(format!("NATS flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_unreachable_server_fails() {
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            NatsSource::connect("nats://127.0.0.1:1"),
        )
        .await;

        match result {
            Ok(Err(BusError::ConnectionFailed(_))) | Err(_) => {}
            Ok(Err(other)) => panic!("unexpected error: {other}"),
            Ok(Ok(_)) => panic!("connected to a closed port"),
        }
    }
}
