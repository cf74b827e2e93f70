//! Store backend trait definition
//!
//! Defines the interface over the shared store. Both the in-memory and the
//! Redis backend implement this trait; everything above it (registries,
//! consumer manager, engine) is backend-agnostic.
//!
//! Contract: every operation reports a typed failure and performs no retries
//! of its own. Callers decide whether an error is retryable. The single
//! exception is `xgroup_create`, which swallows the store's "group already
//! exists" conflict because group creation is idempotent by design here.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use super::error::StoreError;

/// One entry read from a store stream
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Stream key the entry came from
    pub stream_key: String,
    /// Entry id in `{ms}-{seq}` form
    pub id: String,
    /// Flattened field map
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Millisecond timestamp encoded in the entry id's leading component
    pub fn id_timestamp_ms(&self) -> Option<i64> {
        self.id.split('-').next()?.parse().ok()
    }
}

/// Position selector for consumer-group reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// Only entries never delivered to the group (`>`)
    New,
    /// This consumer's pending (delivered, unacknowledged) entries (`0`)
    Pending,
}

/// Summary of a consumer group's pending list
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    pub count: u64,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    pub consumers: u64,
}

/// One message received from a pub/sub subscription
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Subscription to a pub/sub channel or pattern
///
/// The backend forwards messages into a bounded channel; application code
/// consumes the stream and is never called back from the adapter's I/O
/// context.
pub struct PubSubSubscription {
    pub receiver: Pin<Box<dyn Stream<Item = Result<PubSubMessage, StoreError>> + Send>>,
}

/// Store backend trait
#[async_trait]
pub trait StoreBackend: Send + Sync {
    // =========================================================================
    // Keys and counters
    // =========================================================================

    /// Set a value with a TTL
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a key; returns true if it existed
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Refresh a key's TTL; returns false if the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomic increment; sets the TTL only when the counter is created
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Read a counter without incrementing
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// List keys matching a glob pattern (cursor-based scan)
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Sets
    // =========================================================================

    /// Add members to a set; returns the number newly added
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    /// All members of a set (empty when the key is missing)
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Hashes
    // =========================================================================

    /// Set multiple hash fields
    async fn hset_map(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Set a single hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// All fields of a hash (empty when the key is missing)
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Atomic hash-field increment
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    /// Fire-and-forget publish
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Subscribe to a channel, or a pattern when it contains `*`
    async fn subscribe(&self, pattern: &str) -> Result<PubSubSubscription, StoreError>;

    // =========================================================================
    // Streams
    // =========================================================================

    /// Append an entry, trimming approximately to `max_len`; returns the id
    async fn xadd(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: u64,
    ) -> Result<String, StoreError>;

    /// Create a consumer group starting at `start_id` (MKSTREAM implied).
    /// An already-existing group is success.
    async fn xgroup_create(&self, key: &str, group: &str, start_id: &str)
    -> Result<(), StoreError>;

    /// Destroy a consumer group; returns true if it existed
    async fn xgroup_destroy(&self, key: &str, group: &str) -> Result<bool, StoreError>;

    /// Read entries for a consumer group across `keys`, in key order.
    ///
    /// `count` caps entries per stream. `block` applies to `New` reads only.
    /// A missing group on any key yields `StoreError::GroupMissing`.
    async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        position: ReadPosition,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge an entry; returns the number of entries acked (0 or 1)
    async fn xack(&self, key: &str, group: &str, id: &str) -> Result<u64, StoreError>;

    /// Summary of the group's pending list
    async fn xpending(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError>;

    /// Ids of pending entries (any consumer) idle for at least `min_idle_ms`
    async fn xpending_idle(
        &self,
        key: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Claim pending entries idle for at least `min_idle_ms`
    async fn xclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Stream length
    async fn xlen(&self, key: &str) -> Result<u64, StoreError>;

    /// Trim entries with an id below `min_id`; returns the number removed
    async fn xtrim_min_id(&self, key: &str, min_id: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Health and metadata
    // =========================================================================

    /// Health check (validates connection)
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;
}
