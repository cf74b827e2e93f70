//! Shared store adapter
//!
//! Typed wrapper over the shared store with pluggable backends:
//! - In-memory (default) - local-only, for development and single-worker runs
//! - Redis (optional) - shared, for multi-worker deployments
//!
//! The service layer adds a closed flag for shutdown (a closed adapter fails
//! every call with a terminal error, which unwinds the poll loop) and typed
//! JSON helpers for persisted envelopes.

mod backend;
mod error;
mod keys;
mod memory;
mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use backend::{
    PendingSummary, PubSubMessage, PubSubSubscription, ReadPosition, StoreBackend, StreamEntry,
};
pub use error::StoreError;
pub use keys::StoreKey;
pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::core::config::{StoreBackendType, StoreConfig};

/// Store service providing typed access to the configured backend
pub struct StoreService {
    backend: Arc<dyn StoreBackend>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreService")
            .field("backend", &self.backend.backend_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StoreService {
    /// Create a new store service from configuration
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend: Arc<dyn StoreBackend> = match config.backend {
            StoreBackendType::Memory => {
                tracing::debug!("Initializing in-memory store");
                Arc::new(MemoryStore::new())
            }
            StoreBackendType::Redis => {
                let url = config.redis_url.as_ref().ok_or_else(|| {
                    StoreError::Config("REDIS_URL required for the Redis backend".into())
                })?;
                // RedisStore::new logs the sanitized URL internally
                Arc::new(RedisStore::new(url).await?)
            }
        };

        Ok(Self {
            backend,
            closed: AtomicBool::new(false),
        })
    }

    /// Create a store service over an existing backend (used by tests)
    pub fn with_backend(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the backend name
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Close the adapter. Every subsequent call fails with a terminal error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Keys and counters
    // =========================================================================

    pub async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.guard()?;
        self.backend.set_ex(key, value, ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.guard()?;
        self.backend.get(key).await
    }

    pub async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.guard()?;
        self.backend.del(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.guard()?;
        self.backend.expire(key, ttl).await
    }

    pub async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.guard()?;
        self.backend.incr(key, ttl).await
    }

    pub async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.guard()?;
        self.backend.get_counter(key).await
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.guard()?;
        self.backend.scan(pattern).await
    }

    // =========================================================================
    // Typed JSON API (persisted envelopes are JSON for cross-worker reads)
    // =========================================================================

    /// Get and deserialize a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serialize a value to JSON and set it with a TTL
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.set_ex(key, bytes, ttl).await
    }

    // =========================================================================
    // Sets
    // =========================================================================

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.guard()?;
        self.backend.sadd(key, members).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.guard()?;
        self.backend.smembers(key).await
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    pub async fn hset_map(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.guard()?;
        self.backend.hset_map(key, fields).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.guard()?;
        self.backend.hset(key, field, value).await
    }

    pub async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.guard()?;
        self.backend.hget_all(key).await
    }

    pub async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.guard()?;
        self.backend.hincr_by(key, field, delta).await
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.guard()?;
        self.backend.publish(channel, payload).await
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<PubSubSubscription, StoreError> {
        self.guard()?;
        self.backend.subscribe(pattern).await
    }

    // =========================================================================
    // Streams
    // =========================================================================

    pub async fn xadd(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: u64,
    ) -> Result<String, StoreError> {
        self.guard()?;
        self.backend.xadd(key, fields, max_len).await
    }

    pub async fn xgroup_create(
        &self,
        key: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        self.guard()?;
        self.backend.xgroup_create(key, group, start_id).await
    }

    pub async fn xgroup_destroy(&self, key: &str, group: &str) -> Result<bool, StoreError> {
        self.guard()?;
        self.backend.xgroup_destroy(key, group).await
    }

    pub async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        position: ReadPosition,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.guard()?;
        self.backend
            .xread_group(group, consumer, keys, position, count, block)
            .await
    }

    pub async fn xack(&self, key: &str, group: &str, id: &str) -> Result<u64, StoreError> {
        self.guard()?;
        self.backend.xack(key, group, id).await
    }

    pub async fn xpending(&self, key: &str, group: &str) -> Result<PendingSummary, StoreError> {
        self.guard()?;
        self.backend.xpending(key, group).await
    }

    pub async fn xpending_idle(
        &self,
        key: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.guard()?;
        self.backend
            .xpending_idle(key, group, min_idle_ms, count)
            .await
    }

    pub async fn xclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.guard()?;
        self.backend
            .xclaim(key, group, consumer, min_idle_ms, ids)
            .await
    }

    pub async fn xlen(&self, key: &str) -> Result<u64, StoreError> {
        self.guard()?;
        self.backend.xlen(key).await
    }

    pub async fn xtrim_min_id(&self, key: &str, min_id: &str) -> Result<u64, StoreError> {
        self.guard()?;
        self.backend.xtrim_min_id(key, min_id).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.guard()?;
        self.backend.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_service() -> StoreService {
        StoreService::with_backend(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_backend_name() {
        let config = StoreConfig {
            backend: StoreBackendType::Memory,
            redis_url: None,
        };
        let service = StoreService::new(&config).await.unwrap();
        assert_eq!(service.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_redis_backend_requires_url() {
        let config = StoreConfig {
            backend: StoreBackendType::Redis,
            redis_url: None,
        };
        assert!(matches!(
            StoreService::new(&config).await,
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_adapter_fails_terminally() {
        let service = memory_service();
        service.close();
        let err = service.get("k").await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_typed_json_round_trip() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Envelope {
            id: String,
            n: u32,
        }

        let service = memory_service();
        let value = Envelope {
            id: "m1".to_string(),
            n: 7,
        };
        service
            .set_json("k", &value, Duration::from_secs(60))
            .await
            .unwrap();
        let loaded: Option<Envelope> = service.get_json("k").await.unwrap();
        assert_eq!(loaded, Some(value));
    }
}
