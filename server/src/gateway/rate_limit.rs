//! Accept-time rate limiter
//!
//! Fixed 60-second window counter over the store's atomic increment, keyed
//! by source address. On store failure the connection is allowed; accepts
//! must not block on a degraded store.

use std::sync::Arc;
use std::time::Duration;

use crate::core::constants::{CONNECT_RATE_LIMIT, CONNECT_RATE_WINDOW_SECS};
use crate::store::{StoreKey, StoreService};

/// Rate limit bucket name for connection accepts
const CONNECT_BUCKET: &str = "connect";

pub struct ConnectRateLimiter {
    store: Arc<StoreService>,
    limit: u32,
    window: Duration,
}

impl ConnectRateLimiter {
    pub fn new(store: Arc<StoreService>) -> Self {
        Self {
            store,
            limit: CONNECT_RATE_LIMIT,
            window: Duration::from_secs(CONNECT_RATE_WINDOW_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_limit(store: Arc<StoreService>, limit: u32) -> Self {
        Self {
            store,
            limit,
            window: Duration::from_secs(CONNECT_RATE_WINDOW_SECS),
        }
    }

    /// Count an accept attempt from `addr` and decide whether it is allowed
    pub async fn check(&self, addr: &str) -> bool {
        let key = StoreKey::rate_limit(CONNECT_BUCKET, addr);
        let count = match self.store.incr(&key, self.window).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(
                    %addr,
                    error = %e,
                    "Rate limit increment failed, allowing connection"
                );
                return true;
            }
        };

        let allowed = count <= i64::from(self.limit);
        if !allowed {
            tracing::warn!(%addr, count, limit = self.limit, "Connection rate limited");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(limit: u32) -> ConnectRateLimiter {
        let store = Arc::new(StoreService::with_backend(Arc::new(MemoryStore::new())));
        ConnectRateLimiter::with_limit(store, limit)
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let limiter = limiter(5);
        for _ in 0..5 {
            assert!(limiter.check("192.168.1.1").await);
        }
    }

    #[tokio::test]
    async fn test_blocks_over_limit() {
        let limiter = limiter(5);
        for _ in 0..5 {
            limiter.check("192.168.1.1").await;
        }
        assert!(!limiter.check("192.168.1.1").await);
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let limiter = limiter(2);
        limiter.check("10.0.0.1").await;
        limiter.check("10.0.0.1").await;
        assert!(!limiter.check("10.0.0.1").await);
        assert!(limiter.check("10.0.0.2").await);
    }
}
