//! Worker-local message deduplication cache
//!
//! Suppresses double-delivery when the same message id is read twice, e.g.
//! after a reconnect claims pending entries on another stream. Entries
//! evict on their own after a short lifetime, which bounds the window in
//! which a redelivered entry is considered a duplicate.

use std::time::Duration;

use moka::sync::Cache;

use crate::core::constants::{DEDUP_MAX_ENTRIES, DEDUP_TTL_SECS};

/// Recently delivered message ids with per-entry eviction
pub struct DedupCache {
    cache: Cache<String, ()>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEDUP_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(DEDUP_MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// True when the message id was delivered within the eviction window
    pub fn contains(&self, message_id: &str) -> bool {
        self.cache.contains_key(message_id)
    }

    /// Record a delivered message id
    pub fn record(&self, message_id: &str) {
        self.cache.insert(message_id.to_string(), ());
    }

    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_contains() {
        let cache = DedupCache::new();
        assert!(!cache.contains("m1"));
        cache.record("m1");
        assert!(cache.contains("m1"));
        assert!(!cache.contains("m2"));
    }

    #[tokio::test]
    async fn test_entries_evict_after_ttl() {
        let cache = DedupCache::with_ttl(Duration::from_millis(50));
        cache.record("m1");
        assert!(cache.contains("m1"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!cache.contains("m1"));
    }
}
