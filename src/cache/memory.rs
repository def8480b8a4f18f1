use crate::cache::error::{CacheError, CacheResult};
use crate::cache::payload;
use crate::cache::traits::{validate_add_args, validate_group_args, EntryId, StreamCache, StreamEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Stream entry id ordered the way Redis orders `<ms>-<seq>` ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Seq(u64, u64);

impl Seq {
    fn parse(id: &str) -> Option<Self> {
        let (ms, seq) = id.split_once('-')?;
        Some(Seq(ms.parse().ok()?, seq.parse().ok()?))
    }

    fn render(self) -> String {
        format!("{}-{}", self.0, self.1)
    }
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct Group {
    last_delivered: Option<Seq>,
    pending: BTreeMap<Seq, Pending>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<Seq, HashMap<String, Value>>,
    last_id: Option<Seq>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> Seq {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let id = match self.last_id {
            Some(Seq(ms, seq)) if ms >= now_ms => Seq(ms, seq + 1),
            _ => Seq(now_ms, 0),
        };
        self.last_id = Some(id);
        id
    }

    fn entry(&self, stream: &str, seq: Seq) -> Option<StreamEntry> {
        let fields = self.entries.get(&seq)?;
        payload::decode(fields).ok().map(|envelope| StreamEntry {
            id: EntryId::new(stream, seq.render()),
            envelope,
        })
    }
}

/// In-process stream cache.
///
/// Mirrors the Redis stream semantics the bridge relies on: group cursors
/// start at the stream tail, reads mark entries pending, and the stream is
/// trimmed to `stream_len` on every append.
#[derive(Clone)]
pub struct MemoryStreamCache {
    streams: Arc<Mutex<HashMap<String, Stream>>>,
    appended: Arc<Notify>,
    stream_len: usize,
}

impl MemoryStreamCache {
    pub fn new(stream_len: usize) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            appended: Arc::new(Notify::new()),
            stream_len,
        }
    }

    /// Number of entries pending for `group` on `stream`
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn try_read(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
    ) -> CacheResult<Vec<StreamEntry>> {
        let mut all = self.streams.lock();
        let mut out = Vec::new();

        for name in streams {
            let stream = all.get_mut(name).ok_or_else(|| CacheError::NoGroup {
                stream: name.clone(),
                group: group.to_string(),
            })?;
            let cursor = stream
                .groups
                .get(group)
                .ok_or_else(|| CacheError::NoGroup {
                    stream: name.clone(),
                    group: group.to_string(),
                })?
                .last_delivered;

            let fresh: Vec<Seq> = stream
                .entries
                .keys()
                .filter(|seq| cursor.map_or(true, |c| **seq > c))
                .copied()
                .collect();

            for seq in fresh {
                let Some(entry) = stream.entry(name, seq) else {
                    continue;
                };
                if let Some(g) = stream.groups.get_mut(group) {
                    g.last_delivered = Some(seq);
                    g.pending.insert(
                        seq,
                        Pending {
                            consumer: consumer.to_string(),
                            delivered_at: Instant::now(),
                        },
                    );
                }
                out.push(entry);
            }
        }

        Ok(out)
    }
}

impl Default for MemoryStreamCache {
    fn default() -> Self {
        Self::new(crate::cache::DEFAULT_STREAM_LEN)
    }
}

#[async_trait]
impl StreamCache for MemoryStreamCache {
    async fn add(&self, stream: &str, topic: &str, payload: &[u8]) -> CacheResult<EntryId> {
        validate_add_args(stream, topic)?;

        let fields: HashMap<String, Value> = payload::encode(topic, payload)
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Data(v.to_vec())))
            .collect();

        let id = {
            let mut all = self.streams.lock();
            let s = all.entry(stream.to_string()).or_default();
            let seq = s.next_id();
            s.entries.insert(seq, fields);
            while s.entries.len() > self.stream_len {
                s.entries.pop_first();
            }
            seq.render()
        };

        self.appended.notify_waiters();
        Ok(EntryId::new(stream, id))
    }

    async fn group_create(&self, stream: &str, group: &str) -> CacheResult<String> {
        validate_group_args(stream, group)?;

        let mut all = self.streams.lock();
        let s = all.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Err(CacheError::GroupAlreadyExists);
        }
        let tail = s.last_id;
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered: tail,
                pending: BTreeMap::new(),
            },
        );
        Ok("OK".to_string())
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

        let deadline = block.map(|d| tokio::time::Instant::now() + d);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register before checking so an append between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            let entries = self.try_read(streams, group, consumer)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn remove(&self, entry: &EntryId) -> CacheResult<()> {
        let Some(seq) = Seq::parse(entry.id()) else {
            return Ok(());
        };
        if let Some(s) = self.streams.lock().get_mut(entry.stream()) {
            s.entries.remove(&seq);
        }
        Ok(())
    }

    async fn ack(&self, entry: &EntryId, group: &str) -> CacheResult<()> {
        let Some(seq) = Seq::parse(entry.id()) else {
            return Ok(());
        };
        if let Some(g) = self
            .streams
            .lock()
            .get_mut(entry.stream())
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pending.remove(&seq);
        }
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

        let mut all = self.streams.lock();
        let Some(s) = all.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Err(CacheError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };

        let now = Instant::now();
        let mut stale = Vec::new();
        for (seq, pending) in g.pending.iter_mut() {
            if now.duration_since(pending.delivered_at) >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                stale.push(*seq);
            }
        }

        // Entries trimmed or removed since delivery drop out of the pending list.
        let gone: Vec<Seq> = stale
            .iter()
            .filter(|seq| !s.entries.contains_key(seq))
            .copied()
            .collect();
        if let Some(g) = s.groups.get_mut(group) {
            for seq in &gone {
                g.pending.remove(seq);
            }
        }

        Ok(stale.into_iter().filter_map(|seq| s.entry(stream, seq)).collect())
    }

    async fn len(&self, stream: &str) -> CacheResult<usize> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }
}
