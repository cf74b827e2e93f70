//! Subscription registry
//!
//! The authoritative channel↔session mapping is an in-memory bidirectional
//! index; the store holds one set per session
//! (`client:{sessionId}:subscriptions`, TTL-refreshed on write) so a
//! reconnecting session restores its channels on any worker.
//!
//! The two sides commit together: a mutation whose persist step fails is
//! rolled back in memory, so the persisted set always equals the in-memory
//! session bucket after a successful call. Callers serialize operations per
//! session (the supervisor's session lock); cross-session calls may run in
//! parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::core::constants::SUBSCRIPTION_TTL_SECS;
use crate::gateway::error::GatewayError;
use crate::gateway::protocol::is_valid_channel;
use crate::store::{StoreKey, StoreService};

#[derive(Default)]
struct Indexes {
    by_channel: HashMap<String, HashSet<String>>,
    by_session: HashMap<String, HashSet<String>>,
}

/// Subscription registry: in-memory index plus persisted per-session sets
pub struct SubscriptionRegistry {
    store: Arc<StoreService>,
    inner: RwLock<Indexes>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<StoreService>) -> Self {
        Self {
            store,
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Subscribe a session to a channel. Returns whether the subscription
    /// was newly added.
    pub async fn subscribe(
        &self,
        session_id: &str,
        channel: &str,
    ) -> Result<bool, GatewayError> {
        if !is_valid_channel(channel) {
            return Err(GatewayError::InvalidMessage(format!(
                "Invalid channel name: {channel}"
            )));
        }

        let newly_added = {
            let mut indexes = self.inner.write();
            indexes
                .by_channel
                .entry(channel.to_string())
                .or_default()
                .insert(session_id.to_string());
            indexes
                .by_session
                .entry(session_id.to_string())
                .or_default()
                .insert(channel.to_string())
        };

        if let Err(e) = self.persist(session_id).await {
            // Roll back so memory and store stay in step; a re-subscribe of
            // an existing channel has nothing to undo
            if newly_added {
                self.remove_from_memory(session_id, channel);
            }
            return Err(e.into());
        }

        tracing::debug!(%session_id, %channel, newly_added, "Subscribed");
        Ok(newly_added)
    }

    /// Unsubscribe a session from a channel. Returns whether the
    /// subscription existed.
    pub async fn unsubscribe(
        &self,
        session_id: &str,
        channel: &str,
    ) -> Result<bool, GatewayError> {
        let removed = self.remove_from_memory(session_id, channel);
        if !removed {
            return Ok(false);
        }

        if let Err(e) = self.persist(session_id).await {
            // Roll back the removal
            let mut indexes = self.inner.write();
            indexes
                .by_channel
                .entry(channel.to_string())
                .or_default()
                .insert(session_id.to_string());
            indexes
                .by_session
                .entry(session_id.to_string())
                .or_default()
                .insert(channel.to_string());
            return Err(e.into());
        }

        tracing::debug!(%session_id, %channel, "Unsubscribed");
        Ok(true)
    }

    /// Drop every in-memory subscription for a session (worker-local
    /// teardown on disconnect). The persisted set is left alone so a
    /// reconnect — on this worker or another — restores the channels.
    pub fn unsubscribe_all(&self, session_id: &str) -> Vec<String> {
        let mut indexes = self.inner.write();
        let channels: Vec<String> = indexes
            .by_session
            .remove(session_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for channel in &channels {
            if let Some(bucket) = indexes.by_channel.get_mut(channel) {
                bucket.remove(session_id);
                if bucket.is_empty() {
                    indexes.by_channel.remove(channel);
                }
            }
        }
        channels
    }

    /// Re-load a session's persisted channels into the in-memory index.
    /// Called when the first connection for a session attaches on this
    /// worker. Returns the restored channels.
    pub async fn restore(&self, session_id: &str) -> Result<Vec<String>, GatewayError> {
        let key = StoreKey::client_subscriptions(session_id);
        let members = self.store.smembers(&key).await?;

        let channels: Vec<String> = members
            .into_iter()
            .filter(|c| {
                let valid = is_valid_channel(c);
                if !valid {
                    tracing::warn!(%session_id, channel = %c, "Dropping invalid persisted channel");
                }
                valid
            })
            .collect();

        {
            let mut indexes = self.inner.write();
            for channel in &channels {
                indexes
                    .by_channel
                    .entry(channel.clone())
                    .or_default()
                    .insert(session_id.to_string());
                indexes
                    .by_session
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(channel.clone());
            }
        }

        if !channels.is_empty() {
            self.store
                .expire(&key, Duration::from_secs(SUBSCRIPTION_TTL_SECS))
                .await?;
            tracing::debug!(%session_id, count = channels.len(), "Subscriptions restored");
        }
        Ok(channels)
    }

    pub fn subscribers(&self, channel: &str) -> Vec<String> {
        self.inner
            .read()
            .by_channel
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, session_id: &str) -> Vec<String> {
        self.inner
            .read()
            .by_session
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, session_id: &str, channel: &str) -> bool {
        self.inner
            .read()
            .by_session
            .get(session_id)
            .is_some_and(|set| set.contains(channel))
    }

    pub fn all_channels(&self) -> Vec<String> {
        self.inner.read().by_channel.keys().cloned().collect()
    }

    /// Subscriber count per channel
    pub fn stats(&self) -> HashMap<String, usize> {
        self.inner
            .read()
            .by_channel
            .iter()
            .map(|(channel, set)| (channel.clone(), set.len()))
            .collect()
    }

    fn remove_from_memory(&self, session_id: &str, channel: &str) -> bool {
        let mut indexes = self.inner.write();
        let removed = indexes
            .by_session
            .get_mut(session_id)
            .is_some_and(|set| set.remove(channel));

        if removed {
            if indexes
                .by_session
                .get(session_id)
                .is_some_and(HashSet::is_empty)
            {
                indexes.by_session.remove(session_id);
            }
            if let Some(bucket) = indexes.by_channel.get_mut(channel) {
                bucket.remove(session_id);
                if bucket.is_empty() {
                    indexes.by_channel.remove(channel);
                }
            }
        }
        removed
    }

    /// Rewrite the persisted set from the in-memory session bucket
    async fn persist(&self, session_id: &str) -> Result<(), crate::store::StoreError> {
        let channels = self.channels_of(session_id);
        let key = StoreKey::client_subscriptions(session_id);

        self.store.del(&key).await?;
        if channels.is_empty() {
            return Ok(());
        }
        self.store.sadd(&key, &channels).await?;
        self.store
            .expire(&key, Duration::from_secs(SUBSCRIPTION_TTL_SECS))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<StoreService>,
        registry: SubscriptionRegistry,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StoreService::with_backend(Arc::new(MemoryStore::new())));
        Fixture {
            registry: SubscriptionRegistry::new(store.clone()),
            store,
        }
    }

    async fn persisted(fx: &Fixture, session_id: &str) -> Vec<String> {
        let mut members = fx
            .store
            .smembers(&StoreKey::client_subscriptions(session_id))
            .await
            .unwrap();
        members.sort();
        members
    }

    #[tokio::test]
    async fn test_subscribe_returns_newly_added() {
        let fx = fixture();
        assert!(fx.registry.subscribe("s1", "c").await.unwrap());
        assert!(!fx.registry.subscribe("s1", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let fx = fixture();
        let err = fx.registry.subscribe("s1", "bad channel").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidMessage(_)));
        assert!(fx.registry.channels_of("s1").is_empty());
    }

    #[tokio::test]
    async fn test_memory_equals_persisted_after_each_op() {
        let fx = fixture();
        let ops: &[(&str, bool)] = &[
            ("a", true),
            ("b", true),
            ("a", false),
            ("c", true),
            ("b", false),
            ("c", false),
        ];
        for (channel, subscribe) in ops {
            if *subscribe {
                fx.registry.subscribe("s1", channel).await.unwrap();
            } else {
                fx.registry.unsubscribe("s1", channel).await.unwrap();
            }
            let mut in_memory = fx.registry.channels_of("s1");
            in_memory.sort();
            assert_eq!(in_memory, persisted(&fx, "s1").await);
        }
    }

    #[tokio::test]
    async fn test_channel_bucket_removed_only_when_empty() {
        let fx = fixture();
        fx.registry.subscribe("a", "c").await.unwrap();
        fx.registry.subscribe("b", "c").await.unwrap();

        fx.registry.unsubscribe("a", "c").await.unwrap();
        assert_eq!(fx.registry.subscribers("c"), vec!["b"]);
        assert_eq!(fx.registry.all_channels(), vec!["c"]);

        fx.registry.unsubscribe("b", "c").await.unwrap();
        assert!(fx.registry.subscribers("c").is_empty());
        assert!(fx.registry.all_channels().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_missing_is_false() {
        let fx = fixture();
        assert!(!fx.registry.unsubscribe("s1", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_set_deleted_from_store() {
        let fx = fixture();
        fx.registry.subscribe("s1", "c").await.unwrap();
        fx.registry.unsubscribe("s1", "c").await.unwrap();
        let keys = fx.store.scan("sockets:client:*").await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_keeps_persisted_set() {
        let fx = fixture();
        fx.registry.subscribe("s1", "a").await.unwrap();
        fx.registry.subscribe("s1", "b").await.unwrap();

        let mut dropped = fx.registry.unsubscribe_all("s1");
        dropped.sort();
        assert_eq!(dropped, vec!["a", "b"]);
        assert!(fx.registry.channels_of("s1").is_empty());
        assert!(fx.registry.subscribers("a").is_empty());

        // Persisted set survives for reconnect restore
        assert_eq!(persisted(&fx, "s1").await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let fx = fixture();
        fx.registry.subscribe("s1", "a").await.unwrap();
        fx.registry.subscribe("s1", "b").await.unwrap();
        fx.registry.unsubscribe_all("s1");

        let mut restored = fx.registry.restore("s1").await.unwrap();
        restored.sort();
        assert_eq!(restored, vec!["a", "b"]);
        assert!(fx.registry.is_subscribed("s1", "a"));
        assert!(fx.registry.is_subscribed("s1", "b"));
        let mut subs = fx.registry.subscribers("a");
        subs.sort();
        assert_eq!(subs, vec!["s1"]);
    }

    #[tokio::test]
    async fn test_restore_missing_session_is_empty() {
        let fx = fixture();
        assert!(fx.registry.restore("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let fx = fixture();
        fx.registry.subscribe("s1", "a").await.unwrap();
        fx.registry.subscribe("s2", "a").await.unwrap();
        fx.registry.subscribe("s2", "b").await.unwrap();

        let stats = fx.registry.stats();
        assert_eq!(stats.get("a"), Some(&2));
        assert_eq!(stats.get("b"), Some(&1));
    }
}
