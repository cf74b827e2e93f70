//! Session registry
//!
//! Gives every client-chosen `streamName` a stable session id that survives
//! reconnection. Sessions live in the store as hashes with a 24h TTL plus a
//! reverse index from stream name to session id, so any worker resolves the
//! same identity. A background sweep deletes idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{
    SESSION_EMPTY_GRACE_SECS, SESSION_MAX_IDLE_SECS, SESSION_SWEEP_INTERVAL_SECS, SESSION_TTL_SECS,
};
use crate::gateway::protocol::now_ms;
use crate::store::{StoreError, StoreKey, StoreService};

const FIELD_SESSION_ID: &str = "sessionId";
const FIELD_STREAM_NAME: &str = "streamName";
const FIELD_CREATED_AT: &str = "createdAt";
const FIELD_LAST_ACTIVITY: &str = "lastActivity";
const FIELD_ACTIVE_CONNECTIONS: &str = "activeConnections";

/// A persisted session
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub stream_name: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub active_connections: i64,
}

impl Session {
    fn from_hash(hash: &std::collections::HashMap<String, String>) -> Option<Self> {
        Some(Self {
            session_id: hash.get(FIELD_SESSION_ID)?.clone(),
            stream_name: hash.get(FIELD_STREAM_NAME)?.clone(),
            created_at: hash.get(FIELD_CREATED_AT)?.parse().ok()?,
            last_activity_at: hash.get(FIELD_LAST_ACTIVITY)?.parse().ok()?,
            active_connections: hash
                .get(FIELD_ACTIVE_CONNECTIONS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Session registry over the shared store
pub struct SessionRegistry {
    store: Arc<StoreService>,
}

impl SessionRegistry {
    pub fn new(store: Arc<StoreService>) -> Self {
        Self { store }
    }

    /// Resolve the session id for a stream name, creating the session when
    /// none exists. A reverse index pointing at a vanished session hash is
    /// repaired in place.
    pub async fn get_or_create(&self, stream_name: &str) -> Result<String, StoreError> {
        let ttl = Duration::from_secs(SESSION_TTL_SECS);
        let index_key = StoreKey::stream_name(stream_name);

        match self.store.get(&index_key).await {
            Ok(Some(bytes)) => {
                let session_id = String::from_utf8_lossy(&bytes).to_string();
                let session_key = StoreKey::session(&session_id);
                match self.store.hget_all(&session_key).await {
                    Ok(hash) if !hash.is_empty() => {
                        self.store
                            .hset(&session_key, FIELD_LAST_ACTIVITY, &now_ms().to_string())
                            .await?;
                        self.store.expire(&session_key, ttl).await?;
                        self.store.expire(&index_key, ttl).await?;
                        tracing::debug!(%session_id, %stream_name, "Session resumed");
                        return Ok(session_id);
                    }
                    Ok(_) => {
                        // Dangling reverse index; repair and mint a new session
                        tracing::debug!(%session_id, %stream_name, "Repairing dangling session index");
                        let _ = self.store.del(&index_key).await;
                    }
                    Err(e) => {
                        tracing::warn!(%stream_name, error = %e, "Session lookup failed, creating new");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%stream_name, error = %e, "Session index lookup failed, creating new");
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session_key = StoreKey::session(&session_id);
        let now = now_ms().to_string();
        self.store
            .hset_map(
                &session_key,
                &[
                    (FIELD_SESSION_ID.to_string(), session_id.clone()),
                    (FIELD_STREAM_NAME.to_string(), stream_name.to_string()),
                    (FIELD_CREATED_AT.to_string(), now.clone()),
                    (FIELD_LAST_ACTIVITY.to_string(), now),
                    (FIELD_ACTIVE_CONNECTIONS.to_string(), "0".to_string()),
                ],
            )
            .await?;
        self.store.expire(&session_key, ttl).await?;
        self.store
            .set_ex(&index_key, session_id.clone().into_bytes(), ttl)
            .await?;

        tracing::debug!(%session_id, %stream_name, "Session created");
        Ok(session_id)
    }

    /// Refresh a session's activity timestamp and TTL
    pub async fn touch(&self, session_id: &str) -> Result<(), StoreError> {
        let session_key = StoreKey::session(session_id);
        self.store
            .hset(&session_key, FIELD_LAST_ACTIVITY, &now_ms().to_string())
            .await?;
        self.store
            .expire(&session_key, Duration::from_secs(SESSION_TTL_SECS))
            .await?;
        Ok(())
    }

    /// Count a newly accepted connection
    pub async fn inc_conn(&self, session_id: &str) -> Result<i64, StoreError> {
        self.store
            .hincr_by(
                &StoreKey::session(session_id),
                FIELD_ACTIVE_CONNECTIONS,
                1,
            )
            .await
    }

    /// Count a closed connection; clamps at zero
    pub async fn dec_conn(&self, session_id: &str) -> Result<i64, StoreError> {
        let key = StoreKey::session(session_id);
        let count = self
            .store
            .hincr_by(&key, FIELD_ACTIVE_CONNECTIONS, -1)
            .await?;
        if count < 0 {
            self.store.hset(&key, FIELD_ACTIVE_CONNECTIONS, "0").await?;
            return Ok(0);
        }
        Ok(count)
    }

    /// Load a session; degrades to `None` on store errors
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        match self.store.hget_all(&StoreKey::session(session_id)).await {
            Ok(hash) if !hash.is_empty() => Session::from_hash(&hash),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Session read failed");
                None
            }
        }
    }

    /// List every persisted session (pattern scan)
    pub async fn list_all(&self) -> Vec<Session> {
        let keys = match self.store.scan(&StoreKey::session_pattern()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Session scan failed");
                return Vec::new();
            }
        };

        let mut sessions = Vec::new();
        for key in keys {
            if let Ok(hash) = self.store.hget_all(&key).await
                && let Some(session) = Session::from_hash(&hash)
            {
                sessions.push(session);
            }
        }
        sessions
    }

    /// Delete a session and its reverse index
    pub async fn delete(&self, session: &Session) {
        if let Err(e) = self.store.del(&StoreKey::session(&session.session_id)).await {
            tracing::warn!(session_id = %session.session_id, error = %e, "Session delete failed");
        }
        if let Err(e) = self
            .store
            .del(&StoreKey::stream_name(&session.stream_name))
            .await
        {
            tracing::warn!(session_id = %session.session_id, error = %e, "Session index delete failed");
        }
    }

    /// One cleanup pass: delete sessions idle past the max age, or with no
    /// connections past the grace window. Returns the number deleted.
    pub async fn sweep_once(&self) -> usize {
        let now = now_ms();
        let max_idle_ms = (SESSION_MAX_IDLE_SECS * 1000) as i64;
        let grace_ms = (SESSION_EMPTY_GRACE_SECS * 1000) as i64;

        let mut deleted = 0;
        for session in self.list_all().await {
            let idle_ms = now - session.last_activity_at;
            let stale = idle_ms > max_idle_ms
                || (session.active_connections == 0 && idle_ms > grace_ms);
            if stale {
                tracing::debug!(
                    session_id = %session.session_id,
                    idle_ms,
                    active_connections = session.active_connections,
                    "Deleting stale session"
                );
                self.delete(&session).await;
                deleted += 1;
            }
        }
        deleted
    }

    /// Start the periodic cleanup sweep
    pub fn start_sweep_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The interval fires immediately; skip that first tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let deleted = registry.sweep_once().await;
                        if deleted > 0 {
                            tracing::debug!(deleted, "Session sweep completed");
                        }
                    }
                }
            }
            tracing::debug!("Session sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(StoreService::with_backend(Arc::new(
            MemoryStore::new(),
        ))))
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let registry = registry();
        let first = registry.get_or_create("u1").await.unwrap();
        let second = registry.get_or_create("u1").await.unwrap();
        assert_eq!(first, second);

        let other = registry.get_or_create("u2").await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_dangling_index_repaired() {
        let registry = registry();
        let first = registry.get_or_create("u1").await.unwrap();

        // Simulate the session hash expiring while the index survives
        registry
            .store
            .del(&StoreKey::session(&first))
            .await
            .unwrap();

        let second = registry.get_or_create("u1").await.unwrap();
        assert_ne!(first, second);
        assert!(registry.get(&second).await.is_some());
    }

    #[tokio::test]
    async fn test_conn_counting_clamps_at_zero() {
        let registry = registry();
        let sid = registry.get_or_create("u1").await.unwrap();

        assert_eq!(registry.inc_conn(&sid).await.unwrap(), 1);
        assert_eq!(registry.inc_conn(&sid).await.unwrap(), 2);
        assert_eq!(registry.dec_conn(&sid).await.unwrap(), 1);
        assert_eq!(registry.dec_conn(&sid).await.unwrap(), 0);
        assert_eq!(registry.dec_conn(&sid).await.unwrap(), 0);

        let session = registry.get(&sid).await.unwrap();
        assert_eq!(session.active_connections, 0);
    }

    #[tokio::test]
    async fn test_get_returns_session_fields() {
        let registry = registry();
        let sid = registry.get_or_create("u1").await.unwrap();
        let session = registry.get(&sid).await.unwrap();
        assert_eq!(session.session_id, sid);
        assert_eq!(session.stream_name, "u1");
        assert!(session.created_at > 0);
    }

    #[tokio::test]
    async fn test_list_all() {
        let registry = registry();
        registry.get_or_create("u1").await.unwrap();
        registry.get_or_create("u2").await.unwrap();
        let mut names: Vec<String> = registry
            .list_all()
            .await
            .into_iter()
            .map(|s| s.stream_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_sweep_deletes_idle_empty_sessions() {
        let registry = registry();
        let sid = registry.get_or_create("u1").await.unwrap();

        // Age the session past the empty-session grace window
        let old = now_ms() - (SESSION_EMPTY_GRACE_SECS as i64 * 1000) - 1000;
        registry
            .store
            .hset(
                &StoreKey::session(&sid),
                FIELD_LAST_ACTIVITY,
                &old.to_string(),
            )
            .await
            .unwrap();

        assert_eq!(registry.sweep_once().await, 1);
        assert!(registry.get(&sid).await.is_none());
        // The reverse index went with it, so the next connect mints fresh
        let fresh = registry.get_or_create("u1").await.unwrap();
        assert_ne!(fresh, sid);
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_sessions() {
        let registry = registry();
        let sid = registry.get_or_create("u1").await.unwrap();
        registry.inc_conn(&sid).await.unwrap();

        // Recently active with a live connection: survives
        assert_eq!(registry.sweep_once().await, 0);
        assert!(registry.get(&sid).await.is_some());

        // Old but still connected: also survives the grace rule
        let old = now_ms() - (SESSION_EMPTY_GRACE_SECS as i64 * 1000) - 1000;
        registry
            .store
            .hset(
                &StoreKey::session(&sid),
                FIELD_LAST_ACTIVITY,
                &old.to_string(),
            )
            .await
            .unwrap();
        assert_eq!(registry.sweep_once().await, 0);
    }
}
