use std::sync::Arc;
use std::time::Duration;
use telemetry_export::cache::{CacheError, MemoryStreamCache, RedisStreamCache, StreamCache};

const READ_WAIT: Duration = Duration::from_millis(50);

fn unique(name: &str) -> String {
    format!("test:{}:{}", name, uuid::Uuid::new_v4())
}

async fn redis_cache(stream_len: usize) -> Option<Arc<RedisStreamCache>> {
    match RedisStreamCache::new("redis://127.0.0.1:6379/15", stream_len).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(_) => {
            eprintln!("Skipping test: Redis not available");
            None
        }
    }
}

/// Add, read through a group, remove, then read again with a fresh consumer
async fn test_round_trip<S: StreamCache + 'static>(cache: Arc<S>) {
    let stream = unique("events");
    let streams = vec![stream.clone()];

    cache.group_create(&stream, "g1").await.unwrap();
    let e1 = cache.add(&stream, "temp", b"23.5").await.unwrap();

    let entries = cache
        .read_group(&streams, "g1", "c1", Some(READ_WAIT))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, e1);
    assert_eq!(entries[0].envelope.topic(), "temp");
    assert_eq!(entries[0].envelope.payload(), b"23.5");

    cache.remove(&e1).await.unwrap();
    // Removing twice is not an error
    cache.remove(&e1).await.unwrap();

    let entries = cache
        .read_group(&streams, "g1", "c2", Some(READ_WAIT))
        .await
        .unwrap();
    assert!(entries.is_empty());
}

async fn test_validation<S: StreamCache + 'static>(cache: Arc<S>) {
    assert!(matches!(
        cache.group_create("", "g").await,
        Err(CacheError::MissingStream)
    ));
    assert!(matches!(
        cache.group_create("s", "").await,
        Err(CacheError::MissingGroup)
    ));
    assert!(matches!(
        cache.add("", "temp", b"1").await,
        Err(CacheError::InvalidStreamName)
    ));
    assert!(matches!(
        cache.add("s", "", b"1").await,
        Err(CacheError::MissingTopic)
    ));
}

async fn test_group_create_twice<S: StreamCache + 'static>(cache: Arc<S>) {
    let stream = unique("groups");
    let streams = vec![stream.clone()];

    cache.group_create(&stream, "g1").await.unwrap();
    cache.add(&stream, "temp", b"before").await.unwrap();

    assert!(matches!(
        cache.group_create(&stream, "g1").await,
        Err(CacheError::GroupAlreadyExists)
    ));

    cache.add(&stream, "temp", b"after").await.unwrap();

    let entries = cache
        .read_group(&streams, "g1", "c1", Some(READ_WAIT))
        .await
        .unwrap();
    let payloads: Vec<&[u8]> = entries.iter().map(|e| e.envelope.payload()).collect();
    assert_eq!(payloads, vec![b"before".as_slice(), b"after".as_slice()]);
}

async fn test_read_order<S: StreamCache + 'static>(cache: Arc<S>) {
    let stream = unique("order");
    let streams = vec![stream.clone()];
    cache.group_create(&stream, "g1").await.unwrap();

    let mut ids = Vec::new();
    for i in 0..20u8 {
        ids.push(cache.add(&stream, "seq", &[i]).await.unwrap());
    }

    let entries = cache
        .read_group(&streams, "g1", "c1", Some(READ_WAIT))
        .await
        .unwrap();
    let read: Vec<_> = entries.into_iter().map(|e| e.id).collect();
    assert_eq!(read, ids);
}

async fn test_multiple_streams<S: StreamCache + 'static>(cache: Arc<S>) {
    let a = unique("a");
    let b = unique("b");
    cache.group_create(&a, "g1").await.unwrap();
    cache.group_create(&b, "g1").await.unwrap();

    cache.add(&b, "topic-b", b"2").await.unwrap();

    let streams = vec![a.clone(), b.clone()];
    let entries = cache
        .read_group(&streams, "g1", "c1", Some(READ_WAIT))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id.stream(), b);
    assert_eq!(entries[0].envelope.topic(), "topic-b");
}

async fn test_bounded_length<S: StreamCache + 'static>(cache: Arc<S>, cap: usize) {
    let stream = unique("bounded");
    for i in 0..(cap * 10) {
        cache
            .add(&stream, "temp", i.to_string().as_bytes())
            .await
            .unwrap();
    }

    let len = cache.len(&stream).await.unwrap();
    assert!(len >= cap, "stream trimmed below cap: {}", len);
    assert!(len < cap * 3, "stream not bounded: {}", len);
}

async fn run_contract<S: StreamCache + 'static>(cache: Arc<S>, cap: usize) {
    test_round_trip(cache.clone()).await;
    test_validation(cache.clone()).await;
    test_group_create_twice(cache.clone()).await;
    test_read_order(cache.clone()).await;
    test_multiple_streams(cache.clone()).await;
    test_bounded_length(cache, cap).await;
}

#[tokio::test]
async fn test_memory_cache_contract() {
    let cache = Arc::new(MemoryStreamCache::new(100));
    run_contract(cache, 100).await;
}

#[tokio::test]
async fn test_redis_cache_contract() {
    let Some(cache) = redis_cache(100).await else {
        return;
    };
    run_contract(cache, 100).await;
}

#[tokio::test]
async fn test_blocking_read_is_cancellable() {
    let cache = Arc::new(MemoryStreamCache::default());
    let stream = unique("cancel");
    cache.group_create(&stream, "g1").await.unwrap();

    let streams = vec![stream.clone()];
    let read = cache.read_group(&streams, "g1", "c1", None);
    assert!(tokio::time::timeout(READ_WAIT, read).await.is_err());

    // Still usable after the cancelled read
    cache.add(&stream, "temp", b"1").await.unwrap();
    let entries = cache
        .read_group(&streams, "g1", "c1", Some(READ_WAIT))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}
