use crate::cache::error::{CacheError, CacheResult};
use crate::cache::payload;
use crate::cache::traits::{validate_add_args, validate_group_args, EntryId, StreamCache, StreamEntry};
use crate::metrics::EXPORT_METRICS;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default approximate stream length cap
pub const DEFAULT_STREAM_LEN: usize = 1000;

/// Upper bound on entries moved per re-claim pass
const CLAIM_BATCH: usize = 100;

/// Redis streams backed cache
#[derive(Clone)]
pub struct RedisStreamCache {
    client: Arc<Client>,
    connection: ConnectionManager,
    // Blocking XREADGROUP calls hold a connection until data arrives, so they
    // get their own instead of sharing the manager used for appends.
    reader: Arc<Mutex<Option<MultiplexedConnection>>>,
    stream_len: usize,
}

impl RedisStreamCache {
    /// Connect to Redis and verify the connection
    pub async fn new(redis_url: &str, stream_len: usize) -> CacheResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client.clone()).await?;

        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await?;

        tracing::info!(stream_len, "Initialized Redis stream cache");

        Ok(Self {
            client: Arc::new(client),
            connection,
            reader: Arc::new(Mutex::new(None)),
            stream_len,
        })
    }

    /// Build a Redis URL from the bridge's cache settings
    pub fn url(address: &str, password: &str, db: &str) -> String {
        let address = address
            .trim_start_matches("redis://")
            .trim_start_matches("rediss://");
        let db = if db.is_empty() { "0" } else { db };
        if password.is_empty() {
            format!("redis://{}/{}", address, db)
        } else {
            format!("redis://:{}@{}/{}", password, address, db)
        }
    }

    async fn reader_connection(&self) -> CacheResult<MultiplexedConnection> {
        let mut guard = self.reader.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_reader(&self) {
        self.reader.lock().await.take();
    }

    /// Decode stream ids, splitting off the ids of malformed entries
    fn entries_from(stream: &str, ids: Vec<StreamId>) -> (Vec<StreamEntry>, Vec<String>) {
        let mut entries = Vec::with_capacity(ids.len());
        let mut malformed = Vec::new();

        for sid in ids {
            match payload::decode(&sid.map) {
                Ok(envelope) => entries.push(StreamEntry {
                    id: EntryId::new(stream, sid.id),
                    envelope,
                }),
                Err(e) => {
                    tracing::warn!(stream = %stream, id = %sid.id, error = %e, "Discarding malformed stream entry");
                    record("decode", false);
                    malformed.push(sid.id);
                }
            }
        }

        (entries, malformed)
    }

    /// Acknowledge and delete entries that can never be delivered, so they
    /// do not come back through re-claim
    async fn discard(&self, stream: &str, group: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }

        let mut conn = self.connection.clone();
        let acked: redis::RedisResult<usize> = conn.xack(stream, group, ids).await;
        let deleted: redis::RedisResult<usize> = conn.xdel(stream, ids).await;
        let result = acked.and(deleted);
        record("discard", result.is_ok());

        if let Err(e) = result {
            tracing::warn!(stream = %stream, group = %group, count = ids.len(), error = %e, "Failed to discard malformed entries");
        }
    }

    async fn collect(&self, stream: &str, group: &str, ids: Vec<StreamId>) -> Vec<StreamEntry> {
        let (entries, malformed) = Self::entries_from(stream, ids);
        self.discard(stream, group, &malformed).await;
        entries
    }
}

fn record(operation: &str, ok: bool) {
    EXPORT_METRICS
        .cache_operations
        .with_label_values(&[operation, if ok { "ok" } else { "error" }])
        .inc();
}

#[async_trait]
impl StreamCache for RedisStreamCache {
    async fn add(&self, stream: &str, topic: &str, payload: &[u8]) -> CacheResult<EntryId> {
        validate_add_args(stream, topic)?;

        let fields = payload::encode(topic, payload);
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<String> = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(self.stream_len), "*", &fields[..])
            .await;
        record("add", result.is_ok());

        let id = result?;
        tracing::debug!(stream = %stream, id = %id, "Entry appended");
        Ok(EntryId::new(stream, id))
    }

    async fn group_create(&self, stream: &str, group: &str) -> CacheResult<String> {
        validate_group_args(stream, group)?;

        let mut conn = self.connection.clone();
        let result: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(stream, group, "$").await;

        match result {
            Ok(reply) => {
                tracing::info!(stream = %stream, group = %group, "Consumer group created");
                Ok(reply)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Err(CacheError::GroupAlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        block: Option<Duration>,
    ) -> CacheResult<Vec<StreamEntry>> {
        if streams.is_empty() || streams.iter().any(|s| s.is_empty()) {
            return Err(CacheError::MissingStream);
        }
        if group.is_empty() {
            return Err(CacheError::MissingGroup);
        }

        // BLOCK 0 waits indefinitely.
        let block_ms = block.map(|d| d.as_millis().max(1) as usize).unwrap_or(0);
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .block(block_ms);
        let ids: Vec<&str> = vec![">"; streams.len()];

        let mut conn = self.reader_connection().await?;
        let result: redis::RedisResult<Option<StreamReadReply>> =
            conn.xread_options(streams, ids.as_slice(), &options).await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => {
                return Err(CacheError::NoGroup {
                    stream: streams.join(","),
                    group: group.to_string(),
                })
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.reset_reader().await;
                }
                record("read", false);
                return Err(e.into());
            }
        };
        record("read", true);

        let mut entries = Vec::new();
        for key in reply.map(|reply| reply.keys).unwrap_or_default() {
            entries.extend(self.collect(&key.key, group, key.ids).await);
        }
        Ok(entries)
    }

    async fn remove(&self, entry: &EntryId) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<usize> = conn.xdel(entry.stream(), &[entry.id()]).await;
        record("remove", result.is_ok());
        let removed = result?;

        tracing::debug!(entry = %entry, removed, "Entry removed");
        Ok(())
    }

    async fn ack(&self, entry: &EntryId, group: &str) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<usize> =
            conn.xack(entry.stream(), group, &[entry.id()]).await;
        record("ack", result.is_ok());
        result?;
        Ok(())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> CacheResult<Vec<StreamEntry>> {
        validate_group_args(stream, group)?;

        let mut conn = self.connection.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", CLAIM_BATCH)
            .await?;

        let min_idle_ms = min_idle.as_millis() as usize;
        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, stale.as_slice())
            .await?;
        record("claim", true);

        tracing::debug!(stream = %stream, group = %group, claimed = claimed.ids.len(), "Claimed pending entries");
        Ok(self.collect(stream, group, claimed.ids).await)
    }

    async fn len(&self, stream: &str) -> CacheResult<usize> {
        let mut conn = self.connection.clone();
        Ok(conn.xlen(stream).await?)
    }
}
