//! Broadcast engine
//!
//! Owns the publish path, the poll-and-deliver loop, the dedup cache, and
//! client acknowledgment handling. The engine sees connections only through
//! the read-only [`ConnectionView`] the supervisor hands it.
//!
//! Delivery is at-least-once: an entry is acknowledged to the store only
//! when the client confirms it, when it shows up again as a dedup hit, when
//! it goes stale (subscription or age), or when it turns out undecodable.
//! An entry that cannot be handed to an alive connection stays pending and
//! is retried on a later tick, possibly by another worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{
    ACK_RECORD_TTL_SECS, GLOBAL_CHANNEL, MESSAGE_HISTORY_LIMIT, MESSAGE_TTL_SECS,
    POLL_INTERVAL_MS, READ_BATCH_MAX, STATS_TTL_SECS,
};
use crate::gateway::connection::ConnectionView;
use crate::gateway::consumers::{SessionStreamEntry, StreamConsumerManager};
use crate::gateway::dedup::DedupCache;
use crate::gateway::error::GatewayError;
use crate::gateway::protocol::{BroadcastMessage, ServerFrame, is_valid_channel};
use crate::gateway::subscriptions::SubscriptionRegistry;
use crate::store::{StoreKey, StoreService};

/// Window for the messages-per-second gauge
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Broadcast engine
pub struct BroadcastEngine {
    store: Arc<StoreService>,
    consumers: Arc<StreamConsumerManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    connections: Arc<dyn ConnectionView>,
    dedup: DedupCache,
    publish_times: Mutex<VecDeque<Instant>>,
}

impl BroadcastEngine {
    pub fn new(
        store: Arc<StoreService>,
        consumers: Arc<StreamConsumerManager>,
        subscriptions: Arc<SubscriptionRegistry>,
        connections: Arc<dyn ConnectionView>,
    ) -> Self {
        Self {
            store,
            consumers,
            subscriptions,
            connections,
            dedup: DedupCache::new(),
            publish_times: Mutex::new(VecDeque::new()),
        }
    }

    pub fn consumers(&self) -> &Arc<StreamConsumerManager> {
        &self.consumers
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish a message to a channel. Persists the envelope for history,
    /// appends to the channel's stream, and bumps the publish counters.
    pub async fn broadcast_to_channel(
        &self,
        channel: &str,
        data: Value,
        sender_id: Option<String>,
    ) -> Result<String, GatewayError> {
        if !is_valid_channel(channel) {
            return Err(GatewayError::InvalidMessage(format!(
                "Invalid channel name: {channel}"
            )));
        }

        let envelope = BroadcastMessage::new(channel, data, sender_id);
        let ttl = Duration::from_secs(MESSAGE_TTL_SECS);

        self.store
            .set_json(&StoreKey::message(&envelope.message_id), &envelope, ttl)
            .await?;
        self.consumers.publish(channel, &envelope).await?;

        let stats_ttl = Duration::from_secs(STATS_TTL_SECS);
        self.store
            .incr(&StoreKey::stats_total_messages(), stats_ttl)
            .await?;
        self.store
            .incr(&StoreKey::stats_channel_messages(channel), stats_ttl)
            .await?;

        {
            let mut times = self.publish_times.lock();
            times.push_back(Instant::now());
            while times.front().is_some_and(|t| t.elapsed() > RATE_WINDOW) {
                times.pop_front();
            }
        }

        tracing::debug!(message_id = %envelope.message_id, %channel, "Message published");
        Ok(envelope.message_id)
    }

    // =========================================================================
    // Poll and deliver
    // =========================================================================

    /// One poll pass: read each live session's streams and deliver.
    /// Returns false when the store reported a terminal error and the loop
    /// should stop.
    pub async fn poll_once(&self) -> bool {
        for session_id in self.connections.live_sessions() {
            let entries = match self
                .consumers
                .read_for_session(&session_id, READ_BATCH_MAX)
                .await
            {
                Ok(entries) => entries,
                Err(e) if e.is_terminal() => return false,
                Err(e) => {
                    // Degraded store: skip this session, keep the loop alive
                    tracing::warn!(%session_id, error = %e, "Poll read failed");
                    continue;
                }
            };

            for entry in entries {
                self.deliver_stream_entry(&session_id, entry).await;
            }
        }
        true
    }

    /// Deliver one stream entry to a session, or decide its fate:
    /// duplicate, echo, and stale-subscription entries are acked away;
    /// an entry with no alive connection stays pending for retry.
    pub async fn deliver_stream_entry(&self, session_id: &str, entry: SessionStreamEntry) {
        let message = &entry.message;

        if self.dedup.contains(&message.message_id) {
            self.ack_entry(session_id, &entry).await;
            return;
        }

        if message.sender_id.as_deref() == Some(session_id) {
            // Do not echo a sender's own message back
            self.ack_entry(session_id, &entry).await;
            return;
        }

        if message.channel != GLOBAL_CHANNEL
            && !self.subscriptions.is_subscribed(session_id, &message.channel)
        {
            // Stale stream membership after an unsubscribe
            self.ack_entry(session_id, &entry).await;
            return;
        }

        let Some(connection) = self.connections.find_alive(session_id) else {
            // No sink to write to; the entry stays pending and retries
            return;
        };

        if let Err(e) = connection.send_frame(&ServerFrame::message(message)) {
            tracing::debug!(
                %session_id,
                message_id = %message.message_id,
                error = %e,
                "Delivery send failed, entry stays pending"
            );
            connection.mark_pending_ping();
            return;
        }

        // Recorded only after the frame is written: a pending retry must not
        // count as a duplicate of a delivery that never happened
        self.dedup.record(&message.message_id);

        // Remember which entry this message id maps to so a client ack can
        // reach the right stream. Best-effort: losing the record only delays
        // the entry until auto-ack.
        let record = format!("{} {}", entry.stream_key, entry.entry_id);
        if let Err(e) = self
            .store
            .set_ex(
                &StoreKey::client_ack(session_id, &message.message_id),
                record.into_bytes(),
                Duration::from_secs(ACK_RECORD_TTL_SECS),
            )
            .await
        {
            tracing::warn!(%session_id, error = %e, "Ack record write failed");
        }

        // Server-side delivery confirmation; the store ack waits for the client
        let _ = connection.send_frame(&ServerFrame::ack(
            Some(message.message_id.clone()),
            None,
        ));

        tracing::trace!(
            %session_id,
            message_id = %message.message_id,
            channel = %message.channel,
            "Message delivered"
        );
    }

    async fn ack_entry(&self, session_id: &str, entry: &SessionStreamEntry) {
        if let Err(e) = self
            .consumers
            .ack(session_id, &entry.stream_key, &entry.entry_id)
            .await
        {
            tracing::warn!(%session_id, error = %e, "Entry ack failed");
        }
    }

    // =========================================================================
    // Client acknowledgments
    // =========================================================================

    /// Handle a client's confirmation of a delivered message: resolve the
    /// recorded entry id and walk the consumer's streams until one ack
    /// lands. Per-stream failures are tolerated.
    pub async fn handle_client_ack(
        &self,
        connection_id: &str,
        message_id: &str,
    ) -> Result<(), GatewayError> {
        let Some(connection) = self.connections.get(connection_id) else {
            return Ok(());
        };
        let session_id = connection.session_id.clone();

        let ack_key = StoreKey::client_ack(&session_id, message_id);
        let Some(record) = self.store.get(&ack_key).await? else {
            tracing::debug!(%session_id, %message_id, "No ack record for message");
            return Ok(());
        };
        let record = String::from_utf8_lossy(&record).to_string();
        let Some((recorded_stream, entry_id)) = record.split_once(' ') else {
            tracing::warn!(%session_id, %message_id, "Malformed ack record");
            let _ = self.store.del(&ack_key).await;
            return Ok(());
        };

        let Some(consumer) = self.consumers.record(&session_id) else {
            return Ok(());
        };

        // The recorded stream first, then the rest in consumer order
        let mut streams = vec![recorded_stream.to_string()];
        for key in &consumer.stream_keys {
            if key != recorded_stream {
                streams.push(key.clone());
            }
        }

        for stream_key in streams {
            match self.consumers.ack(&session_id, &stream_key, entry_id).await {
                Ok(acked) if acked > 0 => {
                    let _ = self.store.del(&ack_key).await;
                    tracing::trace!(%session_id, %message_id, %stream_key, "Client ack applied");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(%session_id, %stream_key, error = %e, "Ack attempt failed");
                }
            }
        }

        tracing::debug!(%session_id, %message_id, "Client ack matched no pending entry");
        Ok(())
    }

    // =========================================================================
    // History and stats
    // =========================================================================

    /// Recent persisted messages for a channel, newest first. The global
    /// channel matches everything.
    pub async fn get_message_history(
        &self,
        channel: &str,
        limit: Option<usize>,
    ) -> Result<Vec<BroadcastMessage>, GatewayError> {
        let limit = limit.unwrap_or(MESSAGE_HISTORY_LIMIT);

        let mut keys = self.store.scan(&StoreKey::message_pattern()).await?;
        keys.sort();
        let tail = keys.len().saturating_sub(limit);

        let mut messages = Vec::new();
        for key in &keys[tail..] {
            match self.store.get_json::<BroadcastMessage>(key).await {
                Ok(Some(message)) => {
                    if channel == GLOBAL_CHANNEL || message.channel == channel {
                        messages.push(message);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(%key, error = %e, "Skipping unreadable history entry");
                }
            }
        }

        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(messages)
    }

    /// Total messages published across all workers (store counter)
    pub async fn total_messages(&self) -> i64 {
        self.store
            .get_counter(&StoreKey::stats_total_messages())
            .await
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Publish rate over the last minute, this worker only
    pub fn messages_per_second(&self) -> f64 {
        let mut times = self.publish_times.lock();
        while times.front().is_some_and(|t| t.elapsed() > RATE_WINDOW) {
            times.pop_front();
        }
        times.len() as f64 / RATE_WINDOW.as_secs_f64()
    }

    // =========================================================================
    // Poll task
    // =========================================================================

    /// Start the poll-and-deliver tick
    pub fn start_poll_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if !engine.poll_once().await {
                            tracing::debug!("Store closed, stopping poll loop");
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Poll loop stopped");
        })
    }
}
