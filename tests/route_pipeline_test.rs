use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_export::{
    cache::{CacheResult, EntryId, MemoryStreamCache, StreamCache, StreamEntry},
    config::{Config, DeliveryMode, RouteConfig},
    export::ExportService,
    messaging::BusMessage,
    publisher::{PublishError, PublishResult, Publisher},
    routes::mfx::{Frame, CONTENT_TYPE_CBOR, CONTENT_TYPE_JSON},
    routes::RouteState,
    AppError,
};
use tokio::sync::watch;

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    offline: AtomicBool,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], _qos: u8, _retain: bool) -> PublishResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::Connection("broker offline".to_string()));
        }
        self.published.lock().push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Cache whose every call fails as if the store were unreachable
struct UnreachableCache;

fn store_down<T>() -> CacheResult<T> {
    Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
}

#[async_trait]
impl StreamCache for UnreachableCache {
    async fn add(&self, _stream: &str, _topic: &str, _payload: &[u8]) -> CacheResult<EntryId> {
        store_down()
    }

    async fn group_create(&self, _stream: &str, _group: &str) -> CacheResult<String> {
        store_down()
    }

    async fn read_group(
        &self,
        _streams: &[String],
        _group: &str,
        _consumer: &str,
        _block: Option<Duration>,
    ) -> CacheResult<Vec<StreamEntry>> {
        store_down()
    }

    async fn remove(&self, _entry: &EntryId) -> CacheResult<()> {
        store_down()
    }

    async fn ack(&self, _entry: &EntryId, _group: &str) -> CacheResult<()> {
        store_down()
    }

    async fn claim_pending(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        _min_idle: Duration,
    ) -> CacheResult<Vec<StreamEntry>> {
        store_down()
    }

    async fn len(&self, _stream: &str) -> CacheResult<usize> {
        store_down()
    }
}

fn config(delivery: DeliveryMode) -> Config {
    let mut config = Config::default();
    config.server.delivery = delivery;
    config.mqtt.channel = "chan-1".to_string();
    config.cache.read_block_ms = 20;
    config.cache.claim_idle_ms = 50;
    config.routes.push(RouteConfig {
        nats_topic: "channels.*".to_string(),
        mqtt_topic: "export".to_string(),
        route_type: "mfx".to_string(),
        workers: 2,
        ..Default::default()
    });
    config
}

fn frame(content_type: &str, payload: Vec<u8>) -> Vec<u8> {
    Frame {
        channel: "chan-1".to_string(),
        publisher: "thing-1".to_string(),
        protocol: "mqtt".to_string(),
        content_type: content_type.to_string(),
        payload,
        ..Default::default()
    }
    .encode_to_vec()
}

fn cbor_pack() -> Vec<u8> {
    use ciborium::value::Value;

    let pack = Value::Array(vec![Value::Map(vec![
        (Value::Integer(0i64.into()), Value::Text("hum".into())),
        (Value::Integer(2i64.into()), Value::Float(40.5)),
    ])]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&pack, &mut out).unwrap();
    out
}

async fn wait_for_published(publisher: &RecordingPublisher, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while publisher.published.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages were not published in time");
}

#[tokio::test]
async fn test_cached_delivery_end_to_end() {
    let cache = Arc::new(MemoryStreamCache::new(100));
    let publisher = Arc::new(RecordingPublisher::default());
    let service =
        ExportService::new(config(DeliveryMode::Cached), cache.clone(), publisher.clone()).unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let handles = service.start(stop_rx).await.unwrap();
    let registry = service.registry();

    registry
        .dispatch(BusMessage::new(
            "channels.chan-1",
            frame(CONTENT_TYPE_JSON, br#"[{"n":"temp","v":23.5}]"#.to_vec()),
        ))
        .await
        .unwrap();
    registry
        .dispatch(BusMessage::new("channels.chan-1", frame(CONTENT_TYPE_JSON, b"garbage".to_vec())))
        .await
        .unwrap();
    registry
        .dispatch(BusMessage::new("channels.chan-1", frame(CONTENT_TYPE_CBOR, cbor_pack())))
        .await
        .unwrap();

    wait_for_published(&publisher, 2).await;

    stop_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let published = publisher.published.lock();
    assert_eq!(published.len(), 2);
    assert!(published
        .iter()
        .all(|(topic, _)| topic == "channels/chan-1/messages/export"));

    let mut payloads: Vec<String> = published
        .iter()
        .map(|(_, p)| String::from_utf8(p.clone()).unwrap())
        .collect();
    payloads.sort();
    assert_eq!(
        payloads,
        vec![r#"[{"n":"hum","v":40.5}]"#, r#"[{"n":"temp","v":23.5}]"#]
    );

    assert_eq!(
        cache.len("export:channels/chan-1/messages/export").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_fallback_redelivers_after_outage() {
    let cache = Arc::new(MemoryStreamCache::new(100));
    let publisher = Arc::new(RecordingPublisher::default());
    publisher.offline.store(true, Ordering::SeqCst);

    let service =
        ExportService::new(config(DeliveryMode::Fallback), cache.clone(), publisher.clone()).unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handles = service.start(stop_rx).await.unwrap();

    service
        .registry()
        .dispatch(BusMessage::new(
            "channels.chan-1",
            frame(CONTENT_TYPE_JSON, br#"[{"n":"temp","v":1.5}]"#.to_vec()),
        ))
        .await
        .unwrap();

    let stream = "export:channels/chan-1/messages/export";
    tokio::time::timeout(Duration::from_secs(2), async {
        while cache.len(stream).await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message was not staged");

    publisher.offline.store(false, Ordering::SeqCst);
    wait_for_published(&publisher, 1).await;

    stop_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        publisher.published.lock()[0].1,
        br#"[{"n":"temp","v":1.5}]"#.to_vec()
    );
    assert_eq!(cache.len(stream).await.unwrap(), 0);
}

#[test]
fn test_unknown_route_type_fails_service_setup() {
    let mut config = config(DeliveryMode::Direct);
    config.routes[0].route_type = "xml".to_string();

    let result = ExportService::new(
        config,
        Arc::new(MemoryStreamCache::default()),
        Arc::new(RecordingPublisher::default()),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_group_creation_failure_stops_startup() {
    let service = ExportService::new(
        config(DeliveryMode::Cached),
        Arc::new(UnreachableCache),
        Arc::new(RecordingPublisher::default()),
    )
    .unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let result = service.start(stop_rx).await;

    assert!(matches!(result, Err(AppError::Cache(_))));
    assert!(service
        .registry()
        .routes()
        .iter()
        .all(|route| route.state() == RouteState::Idle));
}

#[tokio::test]
async fn test_direct_mode_starts_without_store() {
    let service = ExportService::new(
        config(DeliveryMode::Direct),
        Arc::new(UnreachableCache),
        Arc::new(RecordingPublisher::default()),
    )
    .unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);

    let handles = service.start(stop_rx).await.unwrap();

    stop_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
