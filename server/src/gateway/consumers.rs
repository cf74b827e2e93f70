//! Stream consumer manager
//!
//! One consumer group per session (`client:{sessionId}`), shared across
//! workers by name; each worker reads through its own consumer
//! (`worker:{workerId}:client:{sessionId}`) so unacknowledged entries
//! rebalance if a worker dies. A session's consumer covers the global
//! stream plus one stream per subscribed channel.
//!
//! Reads drain the consumer's pending list first, then new entries, so
//! per-stream ordering survives redelivery. Entries older than the age
//! cutoff are acknowledged and dropped instead of delivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{
    CLAIM_MIN_IDLE_MS, PENDING_DRAIN_CAP, STREAM_ENTRY_MAX_AGE_SECS, STREAM_MAX_LEN,
    STREAM_SWEEP_INTERVAL_SECS, STREAM_TTL_SECS, XREAD_BLOCK_MS,
};
use crate::gateway::protocol::{BroadcastMessage, now_ms};
use crate::store::{ReadPosition, StoreError, StoreKey, StoreService, StreamEntry};

/// Per-session consumer record
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub session_id: String,
    pub group_name: String,
    pub consumer_name: String,
    pub stream_keys: Vec<String>,
    pub is_active: bool,
}

/// A stream entry resolved to its broadcast envelope
#[derive(Debug, Clone)]
pub struct SessionStreamEntry {
    pub stream_key: String,
    pub entry_id: String,
    pub message: BroadcastMessage,
}

/// Manages per-session consumer groups over the store's streams
pub struct StreamConsumerManager {
    store: Arc<StoreService>,
    worker_id: String,
    consumers: RwLock<HashMap<String, ConsumerRecord>>,
    claim_min_idle_ms: u64,
}

impl StreamConsumerManager {
    pub fn new(store: Arc<StoreService>, worker_id: &str) -> Self {
        Self {
            store,
            worker_id: worker_id.to_string(),
            consumers: RwLock::new(HashMap::new()),
            claim_min_idle_ms: CLAIM_MIN_IDLE_MS,
        }
    }

    /// Construct with a custom claim-idle threshold (crash-recovery tests)
    #[cfg(test)]
    pub(crate) fn with_claim_min_idle(
        store: Arc<StoreService>,
        worker_id: &str,
        claim_min_idle_ms: u64,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.to_string(),
            consumers: RwLock::new(HashMap::new()),
            claim_min_idle_ms,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn group_name(session_id: &str) -> String {
        format!("client:{session_id}")
    }

    fn consumer_name(&self, session_id: &str) -> String {
        format!("worker:{}:client:{}", self.worker_id, session_id)
    }

    /// Stream keys covering the global channel plus each subscribed channel
    fn stream_keys_for(channels: &[String]) -> Vec<String> {
        let mut keys = vec![StoreKey::stream_global()];
        for channel in channels {
            let key = StoreKey::stream_channel(channel);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Create (or extend) the consumer for a session.
    ///
    /// Groups start at id `0` so entries published before the consumer
    /// existed are still visible — this is what redelivers the backlog when
    /// a session subscribes or reconnects.
    pub async fn create_consumer(
        &self,
        session_id: &str,
        channels: &[String],
    ) -> Result<(), StoreError> {
        if self.consumers.read().contains_key(session_id) {
            return Box::pin(self.update_channels(session_id, channels)).await;
        }

        let record = ConsumerRecord {
            session_id: session_id.to_string(),
            group_name: Self::group_name(session_id),
            consumer_name: self.consumer_name(session_id),
            stream_keys: Self::stream_keys_for(channels),
            is_active: true,
        };

        for key in &record.stream_keys {
            self.store.xgroup_create(key, &record.group_name, "0").await?;
        }

        tracing::debug!(
            %session_id,
            streams = record.stream_keys.len(),
            "Consumer created"
        );
        self.consumers
            .write()
            .insert(session_id.to_string(), record);
        Ok(())
    }

    /// Reconcile the consumer's streams with the session's current channel
    /// set. New channels get groups; removed streams are retained until
    /// teardown (their stale entries are acked and skipped on delivery).
    pub async fn update_channels(
        &self,
        session_id: &str,
        channels: &[String],
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.consumers.read().get(session_id).cloned() else {
            return Box::pin(self.create_consumer(session_id, channels)).await;
        };

        let mut added = Vec::new();
        for key in Self::stream_keys_for(channels) {
            if !record.stream_keys.contains(&key) {
                self.store.xgroup_create(&key, &record.group_name, "0").await?;
                record.stream_keys.push(key.clone());
                added.push(key);
            }
        }

        if !added.is_empty() {
            tracing::debug!(%session_id, added = added.len(), "Consumer streams extended");
            self.consumers
                .write()
                .insert(session_id.to_string(), record);
        }
        Ok(())
    }

    /// Tear down a session's consumer: delete its group on every stream and
    /// drop its delivery bookkeeping.
    pub async fn destroy_consumer(&self, session_id: &str) {
        let Some(mut record) = self.consumers.write().remove(session_id) else {
            return;
        };
        record.is_active = false;

        for key in &record.stream_keys {
            if let Err(e) = self.store.xgroup_destroy(key, &record.group_name).await {
                tracing::warn!(%session_id, stream = %key, error = %e, "Consumer group destroy failed");
            }
        }

        // Outstanding ack records are meaningless without the group
        match self
            .store
            .scan(&StoreKey::client_ack_pattern(session_id))
            .await
        {
            Ok(keys) => {
                for key in keys {
                    let _ = self.store.del(&key).await;
                }
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Ack record cleanup failed");
            }
        }

        tracing::debug!(%session_id, "Consumer destroyed");
    }

    /// Consumer record snapshot (stream keys in read order)
    pub fn record(&self, session_id: &str) -> Option<ConsumerRecord> {
        self.consumers.read().get(session_id).cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Append an envelope to its channel's stream. Bumps the stream TTL.
    pub async fn publish(
        &self,
        channel: &str,
        envelope: &BroadcastMessage,
    ) -> Result<String, StoreError> {
        let key = StoreKey::stream_for(channel);
        let id = self
            .store
            .xadd(&key, &envelope.to_fields(), STREAM_MAX_LEN)
            .await?;
        self.store
            .expire(&key, Duration::from_secs(STREAM_TTL_SECS))
            .await?;
        Ok(id)
    }

    /// Read up to `max_count` entries for a session: the consumer's pending
    /// entries first (oldest unacknowledged), then new entries with a
    /// blocking read. Entries past the age cutoff are acked and dropped.
    pub async fn read_for_session(
        &self,
        session_id: &str,
        max_count: usize,
    ) -> Result<Vec<SessionStreamEntry>, StoreError> {
        let Some(record) = self.record(session_id) else {
            return Ok(Vec::new());
        };
        if !record.is_active || record.stream_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(max_count);

        let pending = self
            .read_with_group_recovery(&record, ReadPosition::Pending, PENDING_DRAIN_CAP, None)
            .await?;
        self.collect(&record, pending, max_count, &mut out).await;

        if out.len() < max_count {
            let claimed = self.claim_stuck(&record, max_count - out.len()).await;
            self.collect(&record, claimed, max_count, &mut out).await;
        }

        let remaining = max_count - out.len();
        if remaining > 0 {
            let count = remaining.div_ceil(record.stream_keys.len());
            let new = self
                .read_with_group_recovery(
                    &record,
                    ReadPosition::New,
                    count,
                    Some(Duration::from_millis(XREAD_BLOCK_MS)),
                )
                .await?;
            self.collect(&record, new, max_count, &mut out).await;
        }

        Ok(out)
    }

    /// Acknowledge one entry. A missing consumer record is a silent no-op
    /// (the session tore down while the ack was in flight).
    pub async fn ack(
        &self,
        session_id: &str,
        stream_key: &str,
        entry_id: &str,
    ) -> Result<u64, StoreError> {
        let Some(record) = self.record(session_id) else {
            return Ok(0);
        };
        self.store.xack(stream_key, &record.group_name, entry_id).await
    }

    /// Parse raw entries into envelopes, acking expired or undecodable ones
    async fn collect(
        &self,
        record: &ConsumerRecord,
        entries: Vec<StreamEntry>,
        max_count: usize,
        out: &mut Vec<SessionStreamEntry>,
    ) {
        let cutoff = now_ms() - (STREAM_ENTRY_MAX_AGE_SECS * 1000) as i64;

        for entry in entries {
            if out.len() >= max_count {
                // Over-budget entries stay pending and surface next tick
                break;
            }

            if entry.id_timestamp_ms().is_some_and(|ts| ts < cutoff) {
                tracing::debug!(
                    session_id = %record.session_id,
                    stream = %entry.stream_key,
                    id = %entry.id,
                    "Auto-acking expired entry"
                );
                self.ack_entry(record, &entry).await;
                continue;
            }

            match BroadcastMessage::from_fields(&entry.fields) {
                Some(message) => out.push(SessionStreamEntry {
                    stream_key: entry.stream_key.clone(),
                    entry_id: entry.id.clone(),
                    message,
                }),
                None => {
                    // Undecodable entries would redeliver forever; discard
                    tracing::warn!(
                        session_id = %record.session_id,
                        stream = %entry.stream_key,
                        id = %entry.id,
                        "Acking undecodable stream entry"
                    );
                    self.ack_entry(record, &entry).await;
                }
            }
        }
    }

    /// Claim entries another consumer (typically a dead worker's) left
    /// pending too long. This is what rebalances unacknowledged deliveries
    /// across workers. Failures are logged; claiming is recovery, not the
    /// hot path.
    async fn claim_stuck(&self, record: &ConsumerRecord, max_count: usize) -> Vec<StreamEntry> {
        let mut claimed = Vec::new();
        for key in &record.stream_keys {
            let remaining = max_count - claimed.len();
            if remaining == 0 {
                break;
            }

            let ids = match self
                .store
                .xpending_idle(key, &record.group_name, self.claim_min_idle_ms, remaining)
                .await
            {
                Ok(ids) if ids.is_empty() => continue,
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(
                        session_id = %record.session_id,
                        stream = %key,
                        error = %e,
                        "Pending scan failed"
                    );
                    continue;
                }
            };

            match self
                .store
                .xclaim(
                    key,
                    &record.group_name,
                    &record.consumer_name,
                    self.claim_min_idle_ms,
                    &ids,
                )
                .await
            {
                Ok(entries) => {
                    if !entries.is_empty() {
                        tracing::debug!(
                            session_id = %record.session_id,
                            stream = %key,
                            count = entries.len(),
                            "Claimed stuck entries"
                        );
                    }
                    claimed.extend(entries);
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %record.session_id,
                        stream = %key,
                        error = %e,
                        "Claim failed"
                    );
                }
            }
        }
        claimed
    }

    async fn ack_entry(&self, record: &ConsumerRecord, entry: &StreamEntry) {
        if let Err(e) = self
            .store
            .xack(&entry.stream_key, &record.group_name, &entry.id)
            .await
        {
            tracing::warn!(
                session_id = %record.session_id,
                stream = %entry.stream_key,
                error = %e,
                "Ack failed"
            );
        }
    }

    /// Read, recreating lost groups once. A stream that expired (TTL) and
    /// was recreated by a later publish loses its groups; recreating from
    /// id `0` makes every surviving entry visible again.
    async fn read_with_group_recovery(
        &self,
        record: &ConsumerRecord,
        position: ReadPosition,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let result = self
            .store
            .xread_group(
                &record.group_name,
                &record.consumer_name,
                &record.stream_keys,
                position,
                count,
                block,
            )
            .await;

        match result {
            Err(StoreError::GroupMissing(detail)) => {
                tracing::warn!(
                    session_id = %record.session_id,
                    %detail,
                    "Consumer group lost, recreating"
                );
                for key in &record.stream_keys {
                    self.store.xgroup_create(key, &record.group_name, "0").await?;
                }
                self.store
                    .xread_group(
                        &record.group_name,
                        &record.consumer_name,
                        &record.stream_keys,
                        position,
                        count,
                        block,
                    )
                    .await
            }
            other => other,
        }
    }

    /// One trim pass: drop entries older than the age cutoff from every
    /// data stream. Returns the number of entries removed.
    pub async fn sweep_once(&self) -> u64 {
        let min_id = format!(
            "{}-0",
            now_ms() - (STREAM_ENTRY_MAX_AGE_SECS * 1000) as i64
        );

        let keys = match self.store.scan(&StoreKey::stream_pattern()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Stream scan failed");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            match self.store.xtrim_min_id(&key, &min_id).await {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::warn!(stream = %key, error = %e, "Stream trim failed");
                }
            }
        }
        removed
    }

    /// Start the periodic stream trim sweep
    pub fn start_sweep_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(STREAM_SWEEP_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let removed = manager.sweep_once().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Stream sweep completed");
                        }
                    }
                }
            }
            tracing::debug!("Stream sweep stopped");
        })
    }

    /// Destroy every consumer (graceful shutdown)
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.consumers.read().keys().cloned().collect();
        for session_id in session_ids {
            self.destroy_consumer(&session_id).await;
        }
    }
}
