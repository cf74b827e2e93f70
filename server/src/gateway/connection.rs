//! Connections and the connection table
//!
//! The transport is abstracted behind [`ConnectionSink`]: a framed duplex
//! byte sink with `send`, `close(code, reason)`, and a ready state. The
//! WebSocket adapter in `api::ws` implements it for production; tests use a
//! capturing sink. Nothing in the gateway names a transport type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

use super::protocol::{ServerFrame, now_ms};

/// Sink-level failure
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Writability of a connection sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closing,
    Closed,
}

/// A framed duplex message sink attached to one client
pub trait ConnectionSink: Send + Sync {
    /// Queue a text frame for delivery
    fn send_text(&self, text: String) -> Result<(), SinkError>;

    /// Queue a transport-level ping
    fn send_ping(&self) -> Result<(), SinkError>;

    /// Close the connection with a close code and reason
    fn close(&self, code: u16, reason: &str);

    fn ready_state(&self) -> ReadyState;
}

/// One attached client connection
pub struct Connection {
    pub connection_id: String,
    pub session_id: String,
    pub stream_name: String,
    pub remote_addr: String,
    sink: Arc<dyn ConnectionSink>,
    is_alive: AtomicBool,
    last_ping_at: AtomicI64,
    /// Worker-local cache of the session's subscribed channels
    channels: RwLock<HashSet<String>>,
}

impl Connection {
    pub fn new(
        session_id: &str,
        stream_name: &str,
        remote_addr: &str,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            stream_name: stream_name.to_string(),
            remote_addr: remote_addr.to_string(),
            sink,
            is_alive: AtomicBool::new(true),
            last_ping_at: AtomicI64::new(now_ms()),
            channels: RwLock::new(HashSet::new()),
        }
    }

    /// Serialize and send a frame. A sink that is not writable fails without
    /// touching the transport.
    pub fn send_frame(&self, frame: &ServerFrame) -> Result<(), SinkError> {
        if self.sink.ready_state() != ReadyState::Open {
            return Err(SinkError::Closed);
        }
        self.sink.send_text(frame.to_json())
    }

    pub fn send_ping(&self) -> Result<(), SinkError> {
        self.sink.send_ping()
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.sink.close(code, reason);
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::SeqCst) && self.sink.ready_state() == ReadyState::Open
    }

    /// Any inbound frame proves liveness
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
        self.last_ping_at.store(now_ms(), Ordering::SeqCst);
    }

    /// The heartbeat clears the flag; the next inbound frame restores it
    pub fn mark_pending_ping(&self) {
        self.is_alive.store(false, Ordering::SeqCst);
    }

    pub fn heartbeat_expired(&self) -> bool {
        !self.is_alive.load(Ordering::SeqCst)
    }

    pub fn last_ping_at(&self) -> i64 {
        self.last_ping_at.load(Ordering::SeqCst)
    }

    pub fn set_channels(&self, channels: impl IntoIterator<Item = String>) {
        *self.channels.write() = channels.into_iter().collect();
    }

    pub fn add_channel(&self, channel: &str) {
        self.channels.write().insert(channel.to_string());
    }

    pub fn remove_channel(&self, channel: &str) {
        self.channels.write().remove(channel);
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.read().iter().cloned().collect()
    }
}

/// Read-only view of the connection table handed to the broadcast engine
pub trait ConnectionView: Send + Sync {
    /// Connection by id
    fn get(&self, connection_id: &str) -> Option<Arc<Connection>>;

    /// Session ids with at least one alive connection, each listed once
    fn live_sessions(&self) -> Vec<String>;

    /// Any alive connection attached to the session
    fn find_alive(&self, session_id: &str) -> Option<Arc<Connection>>;
}

/// Per-worker connection table
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.inner
            .write()
            .insert(connection.connection_id.clone(), connection);
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.write().remove(connection_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of every connection
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.read().values().cloned().collect()
    }

    /// True when another connection (not `except`) owns the session
    pub fn session_owned_elsewhere(&self, session_id: &str, except: &str) -> bool {
        self.inner
            .read()
            .values()
            .any(|c| c.session_id == session_id && c.connection_id != except)
    }
}

impl ConnectionView for ConnectionTable {
    fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().get(connection_id).cloned()
    }

    fn live_sessions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.inner
            .read()
            .values()
            .filter(|c| c.is_alive())
            .filter_map(|c| seen.insert(c.session_id.clone()).then(|| c.session_id.clone()))
            .collect()
    }

    fn find_alive(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .values()
            .find(|c| c.session_id == session_id && c.is_alive())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::TestSink;

    fn connection(session_id: &str) -> Arc<Connection> {
        Arc::new(Connection::new(
            session_id,
            "stream",
            "127.0.0.1",
            Arc::new(TestSink::new()),
        ))
    }

    #[test]
    fn test_table_insert_remove() {
        let table = ConnectionTable::new();
        let conn = connection("s1");
        let id = conn.connection_id.clone();
        table.insert(conn);
        assert_eq!(table.len(), 1);
        assert!(table.get(&id).is_some());
        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_live_sessions_deduplicates() {
        let table = ConnectionTable::new();
        table.insert(connection("s1"));
        table.insert(connection("s1"));
        table.insert(connection("s2"));
        let mut sessions = table.live_sessions();
        sessions.sort();
        assert_eq!(sessions, vec!["s1", "s2"]);
    }

    #[test]
    fn test_dead_connections_excluded() {
        let table = ConnectionTable::new();
        let conn = connection("s1");
        conn.mark_pending_ping();
        table.insert(conn);
        assert!(table.live_sessions().is_empty());
        assert!(table.find_alive("s1").is_none());
    }

    #[test]
    fn test_session_owned_elsewhere() {
        let table = ConnectionTable::new();
        let first = connection("s1");
        let second = connection("s1");
        let first_id = first.connection_id.clone();
        table.insert(first);
        assert!(!table.session_owned_elsewhere("s1", &first_id));
        table.insert(second);
        assert!(table.session_owned_elsewhere("s1", &first_id));
    }

    #[test]
    fn test_closed_sink_fails_send() {
        let sink = Arc::new(TestSink::new());
        let conn = Connection::new("s1", "stream", "127.0.0.1", sink.clone());
        sink.close(1000, "bye");
        assert!(matches!(
            conn.send_frame(&ServerFrame::ping()),
            Err(SinkError::Closed)
        ));
        assert!(!conn.is_alive());
    }
}
