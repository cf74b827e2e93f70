//! Connection supervisor
//!
//! Per-worker singleton owning the connection table and the connection
//! lifecycle: rate-limited accept, welcome, subscription restore, client
//! command dispatch, heartbeat, and disconnect.
//!
//! Session-scoped mutations (subscribe/unsubscribe/restore/destroy) are
//! serialized through a lazily created per-session lock so the persisted
//! subscription set can never interleave with the in-memory index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterBridge, WorkerMessageKind};
use crate::core::config::GatewayConfig;
use crate::core::constants::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
    DEFAULT_STREAM_NAME, GLOBAL_CHANNEL, MAX_BROADCAST_DATA_BYTES,
};
use crate::gateway::connection::{Connection, ConnectionSink, ConnectionTable, ConnectionView};
use crate::gateway::engine::BroadcastEngine;
use crate::gateway::error::GatewayError;
use crate::gateway::protocol::{ClientCommand, ServerFrame, is_valid_channel};
use crate::gateway::rate_limit::ConnectRateLimiter;
use crate::gateway::sessions::SessionRegistry;

/// Connection supervisor
pub struct ConnectionSupervisor {
    config: GatewayConfig,
    table: Arc<ConnectionTable>,
    sessions: Arc<SessionRegistry>,
    engine: Arc<BroadcastEngine>,
    rate_limiter: ConnectRateLimiter,
    cluster: Option<Arc<ClusterBridge>>,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    accepted_total: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        config: GatewayConfig,
        table: Arc<ConnectionTable>,
        sessions: Arc<SessionRegistry>,
        engine: Arc<BroadcastEngine>,
        rate_limiter: ConnectRateLimiter,
        cluster: Option<Arc<ClusterBridge>>,
    ) -> Self {
        Self {
            config,
            table,
            sessions,
            engine,
            rate_limiter,
            cluster,
            session_locks: Mutex::new(HashMap::new()),
            accepted_total: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn total_accepted(&self) -> u64 {
        self.accepted_total.load(Ordering::SeqCst)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    // =========================================================================
    // Accept
    // =========================================================================

    /// Accept a newly attached sink: rate-limit, resolve the session, send
    /// the welcome frame, restore subscriptions, and ensure the consumer.
    pub async fn accept(
        &self,
        sink: Arc<dyn ConnectionSink>,
        remote_addr: &str,
        stream_name: Option<&str>,
    ) -> Result<Arc<Connection>, GatewayError> {
        if !self.rate_limiter.check(remote_addr).await {
            sink.close(CLOSE_POLICY_VIOLATION, "Rate limit exceeded");
            return Err(GatewayError::RateLimited);
        }

        let stream_name = match stream_name {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_STREAM_NAME,
        };

        let session_id = match self.sessions.get_or_create(stream_name).await {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::error!(%stream_name, error = %e, "Session resolution failed");
                sink.close(CLOSE_INTERNAL_ERROR, "Internal error");
                return Err(e.into());
            }
        };

        let connection = Arc::new(Connection::new(&session_id, stream_name, remote_addr, sink));
        self.table.insert(connection.clone());
        self.accepted_total.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.sessions.inc_conn(&session_id).await {
            tracing::warn!(%session_id, error = %e, "Connection count increment failed");
        }

        if let Err(e) = connection.send_frame(&ServerFrame::welcome(
            &connection.connection_id,
            &session_id,
            stream_name,
        )) {
            tracing::warn!(%session_id, error = %e, "Welcome frame send failed");
        }

        {
            let lock = self.session_lock(&session_id);
            let _guard = lock.lock().await;

            let channels = match self.engine.subscriptions().restore(&session_id).await {
                Ok(channels) => channels,
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "Subscription restore failed");
                    Vec::new()
                }
            };
            connection.set_channels(channels.iter().cloned());

            if let Err(e) = self
                .engine
                .consumers()
                .create_consumer(&session_id, &channels)
                .await
            {
                // The consumer is re-ensured on the next subscribe
                tracing::warn!(%session_id, error = %e, "Consumer creation failed");
            }
        }

        if let Some(cluster) = &self.cluster {
            cluster
                .emit(
                    WorkerMessageKind::ClientConnect,
                    Some(serde_json::json!({
                        "connectionId": connection.connection_id,
                        "sessionId": session_id,
                    })),
                )
                .await;
        }

        tracing::debug!(
            connection_id = %connection.connection_id,
            %session_id,
            %stream_name,
            %remote_addr,
            "Connection accepted"
        );
        Ok(connection)
    }

    // =========================================================================
    // Client commands
    // =========================================================================

    /// Handle one inbound text frame from a connection
    pub async fn handle_text(&self, connection_id: &str, text: &str) {
        let Some(connection) = self.table.get(connection_id) else {
            return;
        };
        connection.mark_alive();

        let command: ClientCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "Unparseable client frame");
                let _ = connection.send_frame(&ServerFrame::error("Invalid message format"));
                return;
            }
        };

        match command {
            ClientCommand::Subscribe {
                channel,
                message_id,
            } => {
                self.handle_subscribe(&connection, &channel, message_id)
                    .await;
            }
            ClientCommand::Unsubscribe {
                channel,
                message_id,
            } => {
                self.handle_unsubscribe(&connection, &channel, message_id)
                    .await;
            }
            ClientCommand::Broadcast {
                channel,
                data,
                message_id,
            } => {
                self.handle_broadcast(&connection, channel.as_deref(), data, message_id)
                    .await;
            }
            ClientCommand::Ack { message_id } => {
                if let Err(e) = self
                    .engine
                    .handle_client_ack(connection_id, &message_id)
                    .await
                {
                    tracing::warn!(%connection_id, error = %e, "Client ack handling failed");
                }
            }
        }
    }

    async fn handle_subscribe(
        &self,
        connection: &Arc<Connection>,
        channel: &str,
        message_id: Option<String>,
    ) {
        let session_id = connection.session_id.clone();
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        match self.engine.subscriptions().subscribe(&session_id, channel).await {
            Ok(_newly_added) => {
                connection.add_channel(channel);
                let channels = self.engine.subscriptions().channels_of(&session_id);
                // Extending the consumer's streams from id 0 makes the
                // channel's backlog visible to the next poll tick
                if let Err(e) = self
                    .engine
                    .consumers()
                    .update_channels(&session_id, &channels)
                    .await
                {
                    tracing::warn!(%session_id, %channel, error = %e, "Consumer stream update failed");
                }
                let _ = connection.send_frame(&ServerFrame::ack(message_id, None));
            }
            Err(e) => {
                let _ = connection.send_frame(&ServerFrame::error(e.client_message()));
            }
        }
    }

    async fn handle_unsubscribe(
        &self,
        connection: &Arc<Connection>,
        channel: &str,
        message_id: Option<String>,
    ) {
        if !is_valid_channel(channel) {
            let _ = connection.send_frame(&ServerFrame::error(format!(
                "Invalid channel name: {channel}"
            )));
            return;
        }

        let session_id = connection.session_id.clone();
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        match self.engine.subscriptions().unsubscribe(&session_id, channel).await {
            Ok(_removed) => {
                connection.remove_channel(channel);
                let _ = connection.send_frame(&ServerFrame::ack(message_id, None));
            }
            Err(e) => {
                let _ = connection.send_frame(&ServerFrame::error(e.client_message()));
            }
        }
    }

    async fn handle_broadcast(
        &self,
        connection: &Arc<Connection>,
        channel: Option<&str>,
        data: serde_json::Value,
        message_id: Option<String>,
    ) {
        let channel = channel.unwrap_or(GLOBAL_CHANNEL);

        // Size cap keeps one client from flooding streams and every
        // subscriber's sink with megabyte frames
        let size = data.to_string().len();
        if size > MAX_BROADCAST_DATA_BYTES {
            let _ = connection.send_frame(&ServerFrame::error(format!(
                "Broadcast data too large ({size} bytes)"
            )));
            return;
        }

        match self
            .engine
            .broadcast_to_channel(channel, data, Some(connection.session_id.clone()))
            .await
        {
            Ok(broadcast_message_id) => {
                let _ = connection.send_frame(&ServerFrame::ack(
                    message_id,
                    Some(serde_json::json!({
                        "broadcastMessageId": broadcast_message_id,
                    })),
                ));
            }
            Err(e) => {
                let _ = connection.send_frame(&ServerFrame::error(e.client_message()));
            }
        }
    }

    /// A transport-level pong (or any inbound frame) proves liveness
    pub fn handle_pong(&self, connection_id: &str) {
        if let Some(connection) = self.table.get(connection_id) {
            connection.mark_alive();
        }
    }

    // =========================================================================
    // Disconnect
    // =========================================================================

    /// Tear down a connection. The session's worker-local state goes with it
    /// only when no other connection on this worker still owns the session.
    pub async fn disconnect(&self, connection_id: &str, code: u16, reason: &str) {
        let Some(connection) = self.table.remove(connection_id) else {
            return;
        };
        let session_id = connection.session_id.clone();

        let owned_elsewhere = self.table.session_owned_elsewhere(&session_id, connection_id);
        if !owned_elsewhere {
            let lock = self.session_lock(&session_id);
            {
                let _guard = lock.lock().await;
                self.engine.subscriptions().unsubscribe_all(&session_id);
                self.engine.consumers().destroy_consumer(&session_id).await;
            }
            self.session_locks.lock().remove(&session_id);
        }

        if let Err(e) = self.sessions.dec_conn(&session_id).await {
            tracing::warn!(%session_id, error = %e, "Connection count decrement failed");
        }

        connection.close(code, reason);

        if let Some(cluster) = &self.cluster {
            cluster
                .emit(
                    WorkerMessageKind::ClientDisconnect,
                    Some(serde_json::json!({
                        "connectionId": connection_id,
                        "sessionId": session_id,
                    })),
                )
                .await;
        }

        tracing::debug!(%connection_id, %session_id, code, reason, "Connection closed");
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    /// One heartbeat pass: close connections that never answered the last
    /// ping, ping the rest, and keep their sessions' activity fresh so the
    /// idle sweep never reaps a session that still has a live connection.
    pub async fn heartbeat_once(&self) {
        let mut touched = std::collections::HashSet::new();
        for connection in self.table.all() {
            if connection.heartbeat_expired() {
                tracing::debug!(
                    connection_id = %connection.connection_id,
                    "Heartbeat timeout"
                );
                self.disconnect(&connection.connection_id, CLOSE_NORMAL, "Ping timeout")
                    .await;
                continue;
            }

            connection.mark_pending_ping();
            let _ = connection.send_ping();
            let _ = connection.send_frame(&ServerFrame::ping());

            if touched.insert(connection.session_id.clone())
                && let Err(e) = self.sessions.touch(&connection.session_id).await
            {
                tracing::debug!(
                    session_id = %connection.session_id,
                    error = %e,
                    "Session touch failed"
                );
            }
        }
    }

    /// Start the heartbeat tick
    pub fn start_heartbeat_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let interval_ms = supervisor.config.ping_interval_ms.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
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
                        supervisor.heartbeat_once().await;
                    }
                }
            }
            tracing::debug!("Heartbeat stopped");
        })
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Destroy every consumer and close every connection with 1001
    pub async fn shutdown(&self) {
        self.engine.consumers().shutdown().await;

        for connection in self.table.all() {
            let session_id = connection.session_id.clone();
            if let Err(e) = self.sessions.dec_conn(&session_id).await {
                tracing::debug!(%session_id, error = %e, "Shutdown decrement failed");
            }
            connection.close(CLOSE_GOING_AWAY, "Server shutting down");
            self.table.remove(&connection.connection_id);
        }
        self.session_locks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{TestSink, gateway_fixture};

    #[tokio::test]
    async fn test_accept_sends_welcome() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "message");
        assert_eq!(frames[0]["data"]["type"], "welcome");
        assert_eq!(frames[0]["data"]["connectionId"], conn.connection_id.as_str());
        assert_eq!(frames[0]["data"]["streamName"], "u1");

        let session = fx.sessions.get(&conn.session_id).await.unwrap();
        assert_eq!(session.active_connections, 1);
        assert_eq!(fx.supervisor.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_default_stream_name() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink, "127.0.0.1", None)
            .await
            .unwrap();
        assert_eq!(conn.stream_name, DEFAULT_STREAM_NAME);
    }

    #[tokio::test]
    async fn test_rate_limit_closes_with_1008_before_welcome() {
        let fx = gateway_fixture().await;

        // Exhaust the window from one address
        for _ in 0..crate::core::constants::CONNECT_RATE_LIMIT {
            let sink = Arc::new(TestSink::new());
            fx.supervisor
                .accept(sink, "10.0.0.9", Some("u1"))
                .await
                .unwrap();
        }

        let sink = Arc::new(TestSink::new());
        let result = fx.supervisor.accept(sink.clone(), "10.0.0.9", Some("u1")).await;
        assert!(matches!(result, Err(GatewayError::RateLimited)));
        assert!(sink.frames().is_empty());
        assert_eq!(
            sink.last_close(),
            Some((CLOSE_POLICY_VIOLATION, "Rate limit exceeded".to_string()))
        );
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_end_to_end() {
        let fx = gateway_fixture().await;

        let sink1 = Arc::new(TestSink::new());
        let c1 = fx
            .supervisor
            .accept(sink1.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();
        let sink2 = Arc::new(TestSink::new());
        let c2 = fx
            .supervisor
            .accept(sink2.clone(), "127.0.0.2", Some("u2"))
            .await
            .unwrap();

        fx.supervisor
            .handle_text(
                &c1.connection_id,
                r#"{"type":"subscribe","channel":"c","messageId":"m1"}"#,
            )
            .await;
        let frames = sink1.frames();
        let ack = &frames[frames.len() - 1];
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["messageId"], "m1");

        fx.supervisor
            .handle_text(
                &c2.connection_id,
                r#"{"type":"broadcast","channel":"c","data":{"x":1},"messageId":"m2"}"#,
            )
            .await;
        let frames = sink2.frames();
        let ack = &frames[frames.len() - 1];
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["messageId"], "m2");
        let broadcast_id = ack["data"]["broadcastMessageId"].as_str().unwrap().to_string();

        fx.engine.poll_once().await;

        let frames = sink1.frames();
        let message = frames
            .iter()
            .find(|f| f["type"] == "message" && f["channel"] == "c")
            .expect("subscriber received the broadcast");
        assert_eq!(message["data"]["x"], 1);
        assert_eq!(message["messageId"], broadcast_id.as_str());
        assert!(message["timestamp"].is_i64());

        // Followed by the server-side delivery ack
        let server_ack = frames
            .iter()
            .find(|f| f["type"] == "ack" && f["messageId"] == broadcast_id.as_str())
            .expect("server-side ack follows delivery");
        assert!(server_ack["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_sender_does_not_receive_own_broadcast() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();

        fx.supervisor
            .handle_text(&conn.connection_id, r#"{"type":"subscribe","channel":"c"}"#)
            .await;
        fx.supervisor
            .handle_text(
                &conn.connection_id,
                r#"{"type":"broadcast","channel":"c","data":1}"#,
            )
            .await;
        fx.engine.poll_once().await;

        let echoed = sink
            .frames()
            .iter()
            .any(|f| f["type"] == "message" && f["channel"] == "c");
        assert!(!echoed);
    }

    #[tokio::test]
    async fn test_global_broadcast_delivery() {
        let fx = gateway_fixture().await;
        let sink1 = Arc::new(TestSink::new());
        let c1 = fx
            .supervisor
            .accept(sink1.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();
        let sink2 = Arc::new(TestSink::new());
        let c2 = fx
            .supervisor
            .accept(sink2.clone(), "127.0.0.2", Some("u2"))
            .await
            .unwrap();

        fx.supervisor
            .handle_text(&c1.connection_id, r#"{"type":"subscribe","channel":"c"}"#)
            .await;
        fx.supervisor
            .handle_text(
                &c2.connection_id,
                r#"{"type":"broadcast","data":"hello"}"#,
            )
            .await;
        fx.engine.poll_once().await;

        let frames = sink1.frames();
        let message = frames
            .iter()
            .find(|f| f["type"] == "message")
            .expect("global broadcast delivered");
        assert_eq!(message["channel"], "*");
        assert_eq!(message["data"], "hello");
    }

    #[tokio::test]
    async fn test_invalid_json_and_unknown_type_get_error_frames() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();

        fx.supervisor
            .handle_text(&conn.connection_id, "not json at all")
            .await;
        fx.supervisor
            .handle_text(&conn.connection_id, r#"{"type":"shout","data":1}"#)
            .await;
        fx.supervisor
            .handle_text(
                &conn.connection_id,
                r#"{"type":"subscribe","channel":"bad channel"}"#,
            )
            .await;

        let errors: Vec<_> = sink
            .frames()
            .into_iter()
            .filter(|f| f["type"] == "error")
            .collect();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|f| f["data"]["error"].is_string()));
        // Malformed input never tears the connection down
        assert_eq!(fx.supervisor.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_broadcast_rejected() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();

        let big = "x".repeat(MAX_BROADCAST_DATA_BYTES + 1);
        let frame = serde_json::json!({"type": "broadcast", "channel": "c", "data": big});
        fx.supervisor
            .handle_text(&conn.connection_id, &frame.to_string())
            .await;

        let frames = sink.frames();
        assert_eq!(frames[frames.len() - 1]["type"], "error");
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();
        let session_id = conn.session_id.clone();

        fx.supervisor
            .handle_text(&conn.connection_id, r#"{"type":"subscribe","channel":"a"}"#)
            .await;
        fx.supervisor
            .handle_text(&conn.connection_id, r#"{"type":"subscribe","channel":"b"}"#)
            .await;

        fx.supervisor
            .disconnect(&conn.connection_id, CLOSE_NORMAL, "bye")
            .await;
        assert!(fx.engine.subscriptions().channels_of(&session_id).is_empty());

        // Same streamName reattaches to the same session with its channels
        let sink2 = Arc::new(TestSink::new());
        let reconnected = fx
            .supervisor
            .accept(sink2.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();
        assert_eq!(reconnected.session_id, session_id);
        let mut channels = reconnected.channels();
        channels.sort();
        assert_eq!(channels, vec!["a", "b"]);

        // Delivery works immediately after restore
        let sink3 = Arc::new(TestSink::new());
        let publisher = fx
            .supervisor
            .accept(sink3, "127.0.0.2", Some("u2"))
            .await
            .unwrap();
        fx.supervisor
            .handle_text(
                &publisher.connection_id,
                r#"{"type":"broadcast","channel":"a","data":42}"#,
            )
            .await;
        fx.engine.poll_once().await;

        let delivered = sink2
            .frames()
            .iter()
            .any(|f| f["type"] == "message" && f["channel"] == "a");
        assert!(delivered);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_state_while_session_shared() {
        let fx = gateway_fixture().await;
        let sink1 = Arc::new(TestSink::new());
        let first = fx
            .supervisor
            .accept(sink1, "127.0.0.1", Some("u1"))
            .await
            .unwrap();
        let sink2 = Arc::new(TestSink::new());
        let second = fx
            .supervisor
            .accept(sink2, "127.0.0.1", Some("u1"))
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);

        fx.supervisor
            .handle_text(&first.connection_id, r#"{"type":"subscribe","channel":"c"}"#)
            .await;

        fx.supervisor
            .disconnect(&first.connection_id, CLOSE_NORMAL, "bye")
            .await;

        // The surviving connection keeps the session's subscriptions
        assert!(fx.engine.subscriptions().is_subscribed(&first.session_id, "c"));
        let session = fx.sessions.get(&first.session_id).await.unwrap();
        assert_eq!(session.active_connections, 1);

        fx.supervisor
            .disconnect(&second.connection_id, CLOSE_NORMAL, "bye")
            .await;
        assert!(!fx.engine.subscriptions().is_subscribed(&first.session_id, "c"));
        let session = fx.sessions.get(&first.session_id).await.unwrap();
        assert_eq!(session.active_connections, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_pings_then_reaps() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        let conn = fx
            .supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();

        // First pass: connection is alive, gets pinged
        fx.supervisor.heartbeat_once().await;
        assert_eq!(sink.ping_count(), 1);
        assert!(sink.frames().iter().any(|f| f["type"] == "ping"));
        assert_eq!(fx.supervisor.connection_count(), 1);

        // No pong: second pass reaps with a normal close
        fx.supervisor.heartbeat_once().await;
        assert_eq!(fx.supervisor.connection_count(), 0);
        assert_eq!(sink.last_close(), Some((CLOSE_NORMAL, "Ping timeout".to_string())));

        // A pong in between keeps it alive
        let sink2 = Arc::new(TestSink::new());
        let conn2 = fx
            .supervisor
            .accept(sink2, "127.0.0.1", Some("u2"))
            .await
            .unwrap();
        fx.supervisor.heartbeat_once().await;
        fx.supervisor.handle_pong(&conn2.connection_id);
        fx.supervisor.heartbeat_once().await;
        assert_eq!(fx.supervisor.connection_count(), 1);
        let _ = conn;
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_1001() {
        let fx = gateway_fixture().await;
        let sink = Arc::new(TestSink::new());
        fx.supervisor
            .accept(sink.clone(), "127.0.0.1", Some("u1"))
            .await
            .unwrap();

        fx.supervisor.shutdown().await;
        assert_eq!(fx.supervisor.connection_count(), 0);
        assert_eq!(
            sink.last_close(),
            Some((CLOSE_GOING_AWAY, "Server shutting down".to_string()))
        );
        assert_eq!(fx.engine.consumers().consumer_count(), 0);
    }
}
