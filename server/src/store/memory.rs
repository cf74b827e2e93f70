//! In-memory store backend
//!
//! Implements the full store contract in process memory: keys with expiry,
//! sets, hashes, counters, pub/sub, and streams with consumer groups and
//! pending lists. Stream entry ids use the same `{ms}-{seq}` format as the
//! Redis backend so id-timestamp extraction behaves identically.
//!
//! Suitable for development and single-worker deployments; a process crash
//! loses all state. Multi-worker deployments use the Redis backend.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Notify, mpsc};

use super::backend::{
    PendingSummary, PubSubMessage, PubSubSubscription, ReadPosition, StoreBackend, StreamEntry,
};
use super::error::StoreError;

/// Per-subscription channel capacity
const PUBSUB_CHANNEL_CAPACITY: usize = 1024;

/// Entry id as (millisecond timestamp, sequence)
type EntryId = (i64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(id: &str) -> Option<EntryId> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

fn wrong_type(key: &str, want: &str) -> StoreError {
    StoreError::Stream(format!("WRONGTYPE key {key} does not hold a {want}"))
}

/// Glob match supporting `*` (any run of characters)
fn glob_match(pattern: &str, value: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let val: Vec<char> = value.chars().collect();
    // Iterative backtracking matcher
    let (mut p, mut v) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while v < val.len() {
        if p < pat.len() && pat[p] != '*' && pat[p] == val[v] {
            p += 1;
            v += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = v;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            v = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[derive(Clone)]
struct StoredEntry {
    id: EntryId,
    fields: HashMap<String, String>,
}

#[derive(Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Clone, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Clone, Default)]
struct StreamState {
    entries: VecDeque<StoredEntry>,
    groups: HashMap<String, GroupState>,
    last_id: EntryId,
}

enum MemoryValue {
    Bytes(Vec<u8>),
    Counter(i64),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
    Stream(StreamState),
}

struct Entry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

type EntryMap = HashMap<String, Entry>;

struct PubSubEntry {
    pattern: String,
    tx: mpsc::Sender<PubSubMessage>,
}

/// In-memory store backend
pub struct MemoryStore {
    entries: RwLock<EntryMap>,
    subscribers: RwLock<Vec<PubSubEntry>>,
    /// Wakes blocked consumer-group reads when any stream grows
    stream_notify: Arc<Notify>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            stream_notify: Arc::new(Notify::new()),
        }
    }

    fn drop_if_expired(entries: &mut EntryMap, key: &str) {
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
    }

    /// Look up a live (non-expired) entry
    fn live<'a>(entries: &'a mut EntryMap, key: &str) -> Option<&'a mut MemoryValue> {
        Self::drop_if_expired(entries, key);
        entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Ensure `key` holds the wanted kind of value, creating it when absent.
    /// Two-phase (check, then re-borrow) so the insert never overlaps an
    /// outstanding borrow.
    fn ensure<'a>(
        entries: &'a mut EntryMap,
        key: &str,
        want: &str,
        is_match: fn(&MemoryValue) -> bool,
        make: fn() -> MemoryValue,
    ) -> Result<&'a mut MemoryValue, StoreError> {
        Self::drop_if_expired(entries, key);
        let ok = match entries.get(key) {
            Some(entry) => is_match(&entry.value),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: make(),
                        expires_at: None,
                    },
                );
                true
            }
        };
        if !ok {
            return Err(wrong_type(key, want));
        }
        Ok(&mut entries.get_mut(key).expect("just ensured").value)
    }

    fn ensure_set<'a>(
        entries: &'a mut EntryMap,
        key: &str,
    ) -> Result<&'a mut HashSet<String>, StoreError> {
        match Self::ensure(
            entries,
            key,
            "set",
            |v| matches!(v, MemoryValue::Set(_)),
            || MemoryValue::Set(HashSet::new()),
        )? {
            MemoryValue::Set(set) => Ok(set),
            _ => unreachable!(),
        }
    }

    fn ensure_hash<'a>(
        entries: &'a mut EntryMap,
        key: &str,
    ) -> Result<&'a mut HashMap<String, String>, StoreError> {
        match Self::ensure(
            entries,
            key,
            "hash",
            |v| matches!(v, MemoryValue::Hash(_)),
            || MemoryValue::Hash(HashMap::new()),
        )? {
            MemoryValue::Hash(hash) => Ok(hash),
            _ => unreachable!(),
        }
    }

    fn ensure_stream<'a>(
        entries: &'a mut EntryMap,
        key: &str,
    ) -> Result<&'a mut StreamState, StoreError> {
        match Self::ensure(
            entries,
            key,
            "stream",
            |v| matches!(v, MemoryValue::Stream(_)),
            || MemoryValue::Stream(StreamState::default()),
        )? {
            MemoryValue::Stream(stream) => Ok(stream),
            _ => unreachable!(),
        }
    }

    fn next_stream_id(stream: &mut StreamState, now_ms: i64) -> EntryId {
        let id = if now_ms <= stream.last_id.0 {
            (stream.last_id.0, stream.last_id.1 + 1)
        } else {
            (now_ms, 0)
        };
        stream.last_id = id;
        id
    }

    fn read_new(
        stream: &mut StreamState,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::GroupMissing(format!("{group} on {stream_key}")))?;

        let mut out = Vec::new();
        for entry in stream.entries.iter() {
            if out.len() >= count {
                break;
            }
            if entry.id > state.last_delivered {
                state.last_delivered = entry.id;
                state.pending.insert(
                    entry.id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                    },
                );
                out.push(StreamEntry {
                    stream_key: stream_key.to_string(),
                    id: format_id(entry.id),
                    fields: entry.fields.clone(),
                });
            }
        }
        Ok(out)
    }

    fn read_pending(
        stream: &mut StreamState,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::GroupMissing(format!("{group} on {stream_key}")))?;

        let ids: Vec<EntryId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .map(|(&id, _)| id)
            .take(count)
            .collect();

        let mut out = Vec::new();
        for id in ids {
            match stream.entries.iter().find(|e| e.id == id) {
                Some(entry) => {
                    out.push(StreamEntry {
                        stream_key: stream_key.to_string(),
                        id: format_id(id),
                        fields: entry.fields.clone(),
                    });
                }
                // Entry trimmed out from under the pending list; drop the
                // dangling reference rather than surface an empty entry
                None => {
                    state.pending.remove(&id);
                }
            }
        }
        Ok(out)
    }

    /// Append an entry with an explicit id timestamp. Test hook for aging
    /// scenarios (auto-ack, trim sweeps).
    #[cfg(test)]
    pub(crate) fn xadd_at(
        &self,
        key: &str,
        fields: &[(String, String)],
        timestamp_ms: i64,
    ) -> String {
        let mut entries = self.entries.write();
        let stream = Self::ensure_stream(&mut entries, key).expect("stream key");
        let id = Self::next_stream_id(stream, timestamp_ms);
        stream.entries.push_back(StoredEntry {
            id,
            fields: fields.iter().cloned().collect(),
        });
        drop(entries);
        self.stream_notify.notify_waiters();
        format_id(id)
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    // =========================================================================
    // Keys and counters
    // =========================================================================

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: MemoryValue::Bytes(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Bytes(b)) => Ok(Some(b.clone())),
            Some(MemoryValue::Counter(c)) => Ok(Some(c.to_string().into_bytes())),
            Some(_) => Err(wrong_type(key, "string")),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self
            .entries
            .write()
            .remove(key)
            .is_some_and(|e| !e.expired());
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        Self::drop_if_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut entries = self.entries.write();
        Self::drop_if_expired(&mut entries, key);
        let ok = match entries.get(key) {
            Some(entry) => matches!(entry.value, MemoryValue::Counter(_)),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: MemoryValue::Counter(0),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                true
            }
        };
        if !ok {
            return Err(wrong_type(key, "counter"));
        }
        match &mut entries.get_mut(key).expect("just ensured").value {
            MemoryValue::Counter(c) => {
                *c += 1;
                Ok(*c)
            }
            _ => unreachable!(),
        }
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Counter(c)) => Ok(Some(*c)),
            Some(MemoryValue::Bytes(b)) => {
                Ok(std::str::from_utf8(b).ok().and_then(|s| s.parse().ok()))
            }
            _ => Ok(None),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.write();
        entries.retain(|_, e| !e.expired());
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    // =========================================================================
    // Sets
    // =========================================================================

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut entries = self.entries.write();
        let set = Self::ensure_set(&mut entries, key)?;
        let mut added = 0;
        for member in members {
            if set.insert(member.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
            None => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    async fn hset_map(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        let hash = Self::ensure_hash(&mut entries, key)?;
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.hset_map(key, &[(field.to_string(), value.to_string())])
            .await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
            None => Ok(HashMap::new()),
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut entries = self.entries.write();
        let hash = Self::ensure_hash(&mut entries, key)?;
        let current: i64 = hash
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter() {
            if glob_match(&sub.pattern, channel) {
                // Fire-and-forget; a full subscriber channel drops the message
                let _ = sub.tx.try_send(PubSubMessage {
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<PubSubSubscription, StoreError> {
        let (tx, mut rx) = mpsc::channel(PUBSUB_CHANNEL_CAPACITY);
        self.subscribers.write().push(PubSubEntry {
            pattern: pattern.to_string(),
            tx,
        });

        let stream = stream! {
            while let Some(msg) = rx.recv().await {
                yield Ok(msg);
            }
        };

        Ok(PubSubSubscription {
            receiver: Box::pin(stream),
        })
    }

    // =========================================================================
    // Streams
    // =========================================================================

    async fn xadd(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: u64,
    ) -> Result<String, StoreError> {
        let id = {
            let mut entries = self.entries.write();
            let stream = Self::ensure_stream(&mut entries, key)?;
            let id = Self::next_stream_id(stream, chrono::Utc::now().timestamp_millis());
            stream.entries.push_back(StoredEntry {
                id,
                fields: fields.iter().cloned().collect(),
            });
            while stream.entries.len() as u64 > max_len {
                stream.entries.pop_front();
            }
            id
        };

        self.stream_notify.notify_waiters();
        Ok(format_id(id))
    }

    async fn xgroup_create(
        &self,
        key: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        // MKSTREAM semantics: create the stream alongside the group
        let stream = Self::ensure_stream(&mut entries, key)?;
        // Existing group is success (BUSYGROUP equivalence)
        if !stream.groups.contains_key(group) {
            let last_delivered = match start_id {
                "$" => stream.last_id,
                "0" => (0, 0),
                other => parse_id(other).unwrap_or((0, 0)),
            };
            stream.groups.insert(
                group.to_string(),
                GroupState {
                    last_delivered,
                    pending: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }

    async fn xgroup_destroy(&self, key: &str, group: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => Ok(s.groups.remove(group).is_some()),
            _ => Ok(false),
        }
    }

    async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        position: ReadPosition,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let out = {
                let mut entries = self.entries.write();
                let mut out = Vec::new();
                for key in keys {
                    let stream = match Self::live(&mut entries, key) {
                        Some(MemoryValue::Stream(s)) => s,
                        _ => {
                            return Err(StoreError::GroupMissing(format!("{group} on {key}")));
                        }
                    };
                    let batch = match position {
                        ReadPosition::New => Self::read_new(stream, key, group, consumer, count)?,
                        ReadPosition::Pending => {
                            Self::read_pending(stream, key, group, consumer, count)?
                        }
                    };
                    out.extend(batch);
                }
                out
            };

            if !out.is_empty() || position == ReadPosition::Pending {
                return Ok(out);
            }
            // Block until new data or the deadline passes
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(out);
                    }
                    let _ = tokio::time::timeout(remaining, self.stream_notify.notified()).await;
                }
                None => return Ok(out),
            }
        }
    }

    async fn xack(&self, key: &str, group: &str, id: &str) -> Result<u64, StoreError> {
        let Some(id) = parse_id(id) else {
            return Ok(0);
        };
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => match s.groups.get_mut(group) {
                Some(state) => Ok(u64::from(state.pending.remove(&id).is_some())),
                None => Ok(0),
            },
            _ => Ok(0),
        }
    }

    async fn xpending(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => match s.groups.get(group) {
                Some(state) => {
                    let consumers: HashSet<&str> = state
                        .pending
                        .values()
                        .map(|p| p.consumer.as_str())
                        .collect();
                    Ok(PendingSummary {
                        count: state.pending.len() as u64,
                        min_id: state.pending.keys().next().map(|&id| format_id(id)),
                        max_id: state.pending.keys().next_back().map(|&id| format_id(id)),
                        consumers: consumers.len() as u64,
                    })
                }
                None => Ok(PendingSummary::default()),
            },
            _ => Ok(PendingSummary::default()),
        }
    }

    async fn xpending_idle(
        &self,
        key: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        let min_idle = Duration::from_millis(min_idle_ms);
        let now = Instant::now();
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => match s.groups.get(group) {
                Some(state) => Ok(state
                    .pending
                    .iter()
                    .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
                    .map(|(&id, _)| format_id(id))
                    .take(count)
                    .collect()),
                None => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn xclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let min_idle = Duration::from_millis(min_idle_ms);
        let now = Instant::now();
        let mut entries = self.entries.write();
        let stream = match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => s,
            _ => return Ok(Vec::new()),
        };
        let Some(state) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for raw in ids {
            let Some(id) = parse_id(raw) else { continue };
            let idle_enough = state
                .pending
                .get(&id)
                .is_some_and(|p| now.duration_since(p.delivered_at) >= min_idle);
            if !idle_enough {
                continue;
            }
            let fields = match stream.entries.iter().find(|e| e.id == id) {
                Some(entry) => entry.fields.clone(),
                None => {
                    // Trimmed entry; claiming it would deliver nothing
                    state.pending.remove(&id);
                    continue;
                }
            };
            let pending = state.pending.get_mut(&id).expect("checked above");
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            claimed.push(StreamEntry {
                stream_key: key.to_string(),
                id: format_id(id),
                fields,
            });
        }
        Ok(claimed)
    }

    async fn xlen(&self, key: &str) -> Result<u64, StoreError> {
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => Ok(s.entries.len() as u64),
            _ => Ok(0),
        }
    }

    async fn xtrim_min_id(&self, key: &str, min_id: &str) -> Result<u64, StoreError> {
        let Some(min) = parse_id(min_id) else {
            return Err(StoreError::Stream(format!("invalid stream id: {min_id}")));
        };
        let mut entries = self.entries.write();
        match Self::live(&mut entries, key) {
            Some(MemoryValue::Stream(s)) => {
                let before = s.entries.len();
                s.entries.retain(|e| e.id >= min);
                Ok((before - s.entries.len()) as u64)
            }
            _ => Ok(0),
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
