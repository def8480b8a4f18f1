//! MQTT publisher over rumqttc

use crate::config::MqttConfig;
use crate::publisher::{PublishError, PublishResult, Publisher};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// How long a publish waits for the broker's confirmation
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Waiter = oneshot::Sender<PublishResult<()>>;

/// Publishes waiting for the broker.
///
/// The event loop reports outgoing publishes in request order, so waiters are
/// queued in that order and moved to `inflight` once their packet id is
/// known. Packets that were inflight when the connection dropped are replayed
/// by the client after reconnecting; their waiters were already failed and
/// the replay must not consume a queued waiter.
#[derive(Default)]
struct Confirmations {
    queued: VecDeque<(QoS, Waiter)>,
    inflight: HashMap<u16, Waiter>,
    retired: HashSet<u16>,
}

impl Confirmations {
    fn outgoing(&mut self, pkid: u16) {
        if pkid != 0 && self.retired.remove(&pkid) {
            debug!(pkid, "Replayed publish");
            return;
        }

        match self.queued.pop_front() {
            Some((QoS::AtMostOnce, waiter)) => {
                let _ = waiter.send(Ok(()));
            }
            Some((_, waiter)) => {
                self.inflight.insert(pkid, waiter);
            }
            None => debug!(pkid, "Outgoing publish without waiter"),
        }
    }

    fn confirmed(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        for (pkid, waiter) in self.inflight.drain() {
            let _ = waiter.send(Err(PublishError::Connection(reason.to_string())));
            self.retired.insert(pkid);
        }
    }

    fn close(&mut self) {
        for (_, waiter) in self.queued.drain(..) {
            let _ = waiter.send(Err(PublishError::Connection("publisher closed".to_string())));
        }
        for (_, waiter) in self.inflight.drain() {
            let _ = waiter.send(Err(PublishError::Connection("publisher closed".to_string())));
        }
    }
}

/// MQTT [`Publisher`] that reports success on PUBACK/PUBCOMP
pub struct MqttPublisher {
    client: AsyncClient,
    confirmations: Arc<Mutex<Confirmations>>,
    send_lock: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl MqttPublisher {
    /// Create a publisher and start its event loop.
    ///
    /// The connection is established in the background; publishes made
    /// before it is up wait for it within the publish timeout.
    pub fn new(config: &MqttConfig, shutdown: watch::Receiver<bool>) -> PublishResult<Self> {
        let options = mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let confirmations = Arc::new(Mutex::new(Confirmations::default()));

        tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&confirmations),
            shutdown,
        ));

        Ok(Self {
            client,
            confirmations,
            send_lock: tokio::sync::Mutex::new(()),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send DISCONNECT to the broker
    pub async fn disconnect(&self) -> PublishResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> PublishResult<()> {
        let qos = qos_level(qos)?;
        let (tx, rx) = oneshot::channel();

        {
            let _ordered = self.send_lock.lock().await;
            self.confirmations.lock().queued.push_back((qos, tx));

            if let Err(e) = self.client.publish(topic, qos, retain, payload.to_vec()).await {
                self.confirmations.lock().queued.pop_back();
                return Err(PublishError::Publish(e.to_string()));
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::Connection("event loop stopped".to_string())),
            Err(_) => Err(PublishError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    confirmations: Arc<Mutex<Confirmations>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => confirmations.lock().outgoing(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => confirmations.lock().confirmed(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => confirmations.lock().confirmed(comp.pkid),
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(session_present = ack.session_present, "Connected to MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "MQTT connection error");
                confirmations.lock().connection_lost(&e.to_string());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    confirmations.lock().close();
    debug!("MQTT event loop stopped");
}

fn qos_level(qos: u8) -> PublishResult<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(PublishError::Publish(format!("invalid QoS {}", other))),
    }
}

/// Split a broker address into host, port and whether TLS is required.
///
/// Accepts `tcp://`, `mqtt://`, `ssl://`, `tls://` and `mqtts://` schemes;
/// a bare `host:port` is plain TCP.
pub fn broker_address(address: &str) -> PublishResult<(String, u16, bool)> {
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("tcp".to_string(), address),
    };

    let tls = match scheme.as_str() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        other => {
            return Err(PublishError::Connection(format!(
                "unsupported broker scheme '{}'",
                other
            )))
        }
    };

    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| PublishError::Connection(format!("invalid broker port '{}'", port)))?;
            (host, port)
        }
        None => (rest, if tls { 8883 } else { 1883 }),
    };

    if host.is_empty() {
        return Err(PublishError::Connection(format!(
            "missing broker host in '{}'",
            address
        )));
    }

    Ok((host.to_string(), port, tls))
}

fn mqtt_options(config: &MqttConfig) -> PublishResult<MqttOptions> {
    let (host, port, tls) = broker_address(&config.host)?;
    let client_id = format!("telemetry-export-{}", uuid::Uuid::new_v4());

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    // Keep the session so unconfirmed publishes are replayed after reconnect.
    options.set_clean_session(false);

    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }

    if tls || config.mtls || config.ca_path.is_some() {
        options.set_transport(tls_transport(config)?);
    }

    Ok(options)
}

fn tls_transport(config: &MqttConfig) -> PublishResult<Transport> {
    if config.skip_tls_ver {
        warn!("Skipping broker certificate verification is not supported, verifying anyway");
    }

    let client_auth = if config.mtls {
        let cert = config
            .cert_path
            .as_deref()
            .ok_or_else(|| PublishError::Tls("mtls requires cert_path".to_string()))?;
        let key = config
            .priv_key_path
            .as_deref()
            .ok_or_else(|| PublishError::Tls("mtls requires priv_key_path".to_string()))?;
        Some((read_pem(cert)?, read_pem(key)?))
    } else {
        None
    };

    match config.ca_path.as_deref() {
        Some(ca) => Ok(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: read_pem(ca)?,
            alpn: None,
            client_auth,
        })),
        None if client_auth.is_some() => Err(PublishError::Tls(
            "mtls requires ca_path".to_string(),
        )),
        None => Ok(Transport::tls_with_default_config()),
    }
}

fn read_pem(path: &Path) -> PublishResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| PublishError::Tls(format!("failed to read {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_address() {
        assert_eq!(
            broker_address("tcp://broker:1884").unwrap(),
            ("broker".to_string(), 1884, false)
        );
        assert_eq!(
            broker_address("ssl://broker").unwrap(),
            ("broker".to_string(), 8883, true)
        );
        assert_eq!(
            broker_address("localhost:1883").unwrap(),
            ("localhost".to_string(), 1883, false)
        );
        assert!(broker_address("ws://broker:80").is_err());
        assert!(broker_address("tcp://broker:notaport").is_err());
        assert!(broker_address("tcp://:1883").is_err());
    }

    #[test]
    fn test_qos_level() {
        assert_eq!(qos_level(1).unwrap(), QoS::AtLeastOnce);
        assert!(qos_level(3).is_err());
    }

    #[test]
    fn test_confirmations_follow_request_order() {
        let mut confirmations = Confirmations::default();
        let (tx0, mut rx0) = oneshot::channel();
        let (tx1, mut rx1) = oneshot::channel();
        confirmations.queued.push_back((QoS::AtMostOnce, tx0));
        confirmations.queued.push_back((QoS::AtLeastOnce, tx1));

        confirmations.outgoing(0);
        assert!(rx0.try_recv().unwrap().is_ok());

        confirmations.outgoing(7);
        assert!(rx1.try_recv().is_err());
        confirmations.confirmed(7);
        assert!(rx1.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_replay_after_connection_loss_is_skipped() {
        let mut confirmations = Confirmations::default();
        let (lost_tx, mut lost_rx) = oneshot::channel();
        let (next_tx, mut next_rx) = oneshot::channel();

        confirmations.queued.push_back((QoS::AtLeastOnce, lost_tx));
        confirmations.outgoing(3);
        confirmations.connection_lost("broker gone");
        assert!(matches!(
            lost_rx.try_recv().unwrap(),
            Err(PublishError::Connection(_))
        ));

        confirmations.queued.push_back((QoS::AtLeastOnce, next_tx));
        confirmations.outgoing(3);
        assert!(next_rx.try_recv().is_err());
        confirmations.outgoing(4);
        confirmations.confirmed(4);
        assert!(next_rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_missing_ca_file_is_tls_error() {
        let config = MqttConfig {
            host: "ssl://broker:8883".to_string(),
            ca_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(
            MqttPublisher::new(&config, rx),
            Err(PublishError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_without_broker_fails() {
        let config = MqttConfig {
            host: "tcp://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(false);
        let publisher = MqttPublisher::new(&config, rx)
            .unwrap()
            .with_timeout(Duration::from_millis(200));

        assert!(publisher.publish("export", b"x", 1, false).await.is_err());
        tx.send(true).unwrap();
    }
}
