//! Inter-worker cluster bridge
//!
//! Workers exchange control messages over the store's pubsub on a single
//! control channel. The bridge is informational: broadcast fan-out rides
//! the store's streams and never depends on it. Each worker publishes a
//! periodic `ping` with its connection counts, mirrors accept/close events,
//! and keeps a last-seen table per peer that `/stats` can surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{CLUSTER_CONTROL_CHANNEL, CLUSTER_PING_INTERVAL_SECS};
use crate::gateway::protocol::now_ms;
use crate::gateway::{ConnectionTable, ConnectionView};
use crate::store::StoreService;

/// Control message kinds exchanged between workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessageKind {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "broadcast")]
    Broadcast,
    #[serde(rename = "client-connect")]
    ClientConnect,
    #[serde(rename = "client-disconnect")]
    ClientDisconnect,
}

/// One control message on the cluster channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(rename = "type")]
    pub kind: WorkerMessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "workerId")]
    pub worker_id: String,
    pub timestamp: i64,
}

/// Last-seen state for a peer worker
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Cluster bridge for one worker
pub struct ClusterBridge {
    store: Arc<StoreService>,
    table: Arc<ConnectionTable>,
    worker_id: String,
    peers: RwLock<HashMap<String, PeerStatus>>,
}

impl ClusterBridge {
    pub fn new(store: Arc<StoreService>, table: Arc<ConnectionTable>, worker_id: &str) -> Self {
        Self {
            store,
            table,
            worker_id: worker_id.to_string(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Snapshot of known peers (this worker excluded)
    pub fn peers(&self) -> HashMap<String, PeerStatus> {
        self.peers.read().clone()
    }

    /// Publish a control message. Failures are logged, never propagated;
    /// the control plane must not disturb the data plane.
    pub async fn emit(&self, kind: WorkerMessageKind, data: Option<Value>) {
        let message = WorkerMessage {
            kind,
            data,
            worker_id: self.worker_id.clone(),
            timestamp: now_ms(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Cluster message encode failed");
                return;
            }
        };
        if let Err(e) = self.store.publish(CLUSTER_CONTROL_CHANNEL, &payload).await {
            tracing::debug!(error = %e, "Cluster publish failed");
        }
    }

    fn handle_message(&self, message: WorkerMessage) {
        if message.worker_id == self.worker_id {
            return;
        }
        match message.kind {
            WorkerMessageKind::Ping => {
                self.peers.write().insert(
                    message.worker_id.clone(),
                    PeerStatus {
                        last_seen: message.timestamp,
                        data: message.data,
                    },
                );
            }
            WorkerMessageKind::Broadcast => {
                // Fan-out rides the store's streams; peers' broadcasts are
                // informational here
                tracing::trace!(worker = %message.worker_id, "Peer broadcast notice");
            }
            WorkerMessageKind::ClientConnect | WorkerMessageKind::ClientDisconnect => {
                tracing::trace!(
                    worker = %message.worker_id,
                    kind = ?message.kind,
                    "Peer connection event"
                );
            }
        }
    }

    /// Start the bridge: a subscriber draining the control channel and a
    /// periodic health ping.
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        match self.store.subscribe(CLUSTER_CONTROL_CHANNEL).await {
            Ok(mut subscription) => {
                let bridge = Arc::clone(self);
                let mut sub_shutdown = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = sub_shutdown.changed() => {
                                if *sub_shutdown.borrow() {
                                    break;
                                }
                            }
                            msg = subscription.receiver.next() => {
                                match msg {
                                    Some(Ok(msg)) => {
                                        match serde_json::from_slice::<WorkerMessage>(&msg.payload) {
                                            Ok(message) => bridge.handle_message(message),
                                            Err(e) => {
                                                tracing::debug!(error = %e, "Undecodable cluster message");
                                            }
                                        }
                                    }
                                    Some(Err(e)) => {
                                        tracing::debug!(error = %e, "Cluster subscription error");
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                    tracing::debug!("Cluster subscriber stopped");
                }));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cluster subscription failed, bridge runs send-only");
            }
        }

        let bridge = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(CLUSTER_PING_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let connections = bridge.table.len();
                        let sessions = bridge.table.live_sessions().len();
                        bridge
                            .emit(
                                WorkerMessageKind::Ping,
                                Some(serde_json::json!({
                                    "connections": connections,
                                    "sessions": sessions,
                                })),
                            )
                            .await;
                    }
                }
            }
            tracing::debug!("Cluster ping stopped");
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn bridge(worker_id: &str, store: Arc<StoreService>) -> Arc<ClusterBridge> {
        Arc::new(ClusterBridge::new(
            store,
            Arc::new(ConnectionTable::new()),
            worker_id,
        ))
    }

    #[test]
    fn test_message_wire_shape() {
        let message = WorkerMessage {
            kind: WorkerMessageKind::ClientConnect,
            data: Some(serde_json::json!({"connectionId": "c1"})),
            worker_id: "w1".to_string(),
            timestamp: 123,
        };
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "client-connect");
        assert_eq!(value["workerId"], "w1");
        assert_eq!(value["timestamp"], 123);
        assert_eq!(value["data"]["connectionId"], "c1");

        let round: WorkerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(round.kind, WorkerMessageKind::ClientConnect);
    }

    #[test]
    fn test_kind_names() {
        for (kind, name) in [
            (WorkerMessageKind::Ping, "\"ping\""),
            (WorkerMessageKind::Broadcast, "\"broadcast\""),
            (WorkerMessageKind::ClientConnect, "\"client-connect\""),
            (WorkerMessageKind::ClientDisconnect, "\"client-disconnect\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
        }
    }

    #[tokio::test]
    async fn test_peer_ping_tracked_and_own_filtered() {
        let store = Arc::new(StoreService::with_backend(Arc::new(MemoryStore::new())));
        let ours = bridge("w1", store.clone());
        let theirs = bridge("w2", store.clone());

        let (_tx, rx) = watch::channel(false);
        let _handles = ours.start(rx).await;
        tokio::task::yield_now().await;

        theirs
            .emit(WorkerMessageKind::Ping, Some(serde_json::json!({"connections": 3})))
            .await;
        // Own pings must not show up as peers
        ours.emit(WorkerMessageKind::Ping, None).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let peers = ours.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers.contains_key("w2"));
        assert_eq!(peers["w2"].data.as_ref().unwrap()["connections"], 3);
    }
}
