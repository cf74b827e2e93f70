//! Stream-based fan-out gateway
//!
//! The core between the shared store and live client connections:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ConnectionSupervisor                         │
//! │   accept / commands / heartbeat / disconnect                     │
//! │          │                                    ▲                  │
//! │          ▼                                    │ sink frames      │
//! │   ┌─────────────────┐   read-only view  ┌──────────────┐         │
//! │   │ BroadcastEngine │◄──────────────────│ Connection   │         │
//! │   │ publish / poll  │                   │ Table        │         │
//! │   └──────┬──────────┘                   └──────────────┘         │
//! │          │ owns                                                  │
//! │   ┌──────▼──────────────┐   ┌──────────────────┐                 │
//! │   │ StreamConsumer      │   │ Subscription /   │                 │
//! │   │ Manager             │   │ Session Registry │                 │
//! │   └──────┬──────────────┘   └───────┬──────────┘                 │
//! │          └────────────┬─────────────┘                            │
//! │                 ┌─────▼──────┐                                   │
//! │                 │ Store      │  streams / consumer groups /      │
//! │                 │ Adapter    │  KV / sets / hashes / pubsub      │
//! │                 └────────────┘                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod consumers;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod rate_limit;
pub mod sessions;
pub mod subscriptions;
pub mod supervisor;

pub use connection::{Connection, ConnectionSink, ConnectionTable, ConnectionView, ReadyState,
    SinkError};
pub use consumers::{ConsumerRecord, SessionStreamEntry, StreamConsumerManager};
pub use dedup::DedupCache;
pub use engine::BroadcastEngine;
pub use error::GatewayError;
pub use protocol::{BroadcastMessage, ClientCommand, ServerFrame};
pub use rate_limit::ConnectRateLimiter;
pub use sessions::{Session, SessionRegistry};
pub use subscriptions::SubscriptionRegistry;
pub use supervisor::ConnectionSupervisor;

#[cfg(test)]
pub(crate) mod testing {
    //! Shared test fixtures for the gateway

    use std::sync::Arc;

    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::connection::{ConnectionSink, ConnectionTable, ConnectionView, ReadyState,
        SinkError};
    use super::engine::BroadcastEngine;
    use super::rate_limit::ConnectRateLimiter;
    use super::sessions::SessionRegistry;
    use super::subscriptions::SubscriptionRegistry;
    use super::supervisor::ConnectionSupervisor;
    use crate::core::config::GatewayConfig;
    use crate::gateway::consumers::StreamConsumerManager;
    use crate::store::{MemoryStore, StoreService};

    /// Sink that records everything written to it
    pub struct TestSink {
        frames: Mutex<Vec<String>>,
        pings: AtomicUsize,
        state: Mutex<ReadyState>,
        closed_with: Mutex<Option<(u16, String)>>,
    }

    impl Default for TestSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestSink {
        pub fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                pings: AtomicUsize::new(0),
                state: Mutex::new(ReadyState::Open),
                closed_with: Mutex::new(None),
            }
        }

        /// Parsed frames written so far
        pub fn frames(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .iter()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect()
        }

        pub fn ping_count(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }

        pub fn last_close(&self) -> Option<(u16, String)> {
            self.closed_with.lock().clone()
        }
    }

    impl ConnectionSink for TestSink {
        fn send_text(&self, text: String) -> Result<(), SinkError> {
            if *self.state.lock() != ReadyState::Open {
                return Err(SinkError::Closed);
            }
            self.frames.lock().push(text);
            Ok(())
        }

        fn send_ping(&self) -> Result<(), SinkError> {
            if *self.state.lock() != ReadyState::Open {
                return Err(SinkError::Closed);
            }
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self, code: u16, reason: &str) {
            *self.state.lock() = ReadyState::Closed;
            *self.closed_with.lock() = Some((code, reason.to_string()));
        }

        fn ready_state(&self) -> ReadyState {
            *self.state.lock()
        }
    }

    /// A fully wired gateway over the in-memory store
    pub struct GatewayFixture {
        pub store: Arc<StoreService>,
        pub sessions: Arc<SessionRegistry>,
        pub engine: Arc<BroadcastEngine>,
        pub supervisor: Arc<ConnectionSupervisor>,
    }

    pub async fn gateway_fixture() -> GatewayFixture {
        let store = Arc::new(StoreService::with_backend(Arc::new(MemoryStore::new())));
        let table = Arc::new(ConnectionTable::new());
        let sessions = Arc::new(SessionRegistry::new(store.clone()));
        let subscriptions = Arc::new(SubscriptionRegistry::new(store.clone()));
        let consumers = Arc::new(StreamConsumerManager::new(store.clone(), "test-worker"));
        let engine = Arc::new(BroadcastEngine::new(
            store.clone(),
            consumers,
            subscriptions,
            table.clone() as Arc<dyn ConnectionView>,
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            GatewayConfig {
                ping_interval_ms: 30_000,
                heartbeat_timeout_ms: 60_000,
                workers: 1,
            },
            table.clone(),
            sessions.clone(),
            engine.clone(),
            ConnectRateLimiter::new(store.clone()),
            None,
        ));

        GatewayFixture {
            store,
            sessions,
            engine,
            supervisor,
        }
    }
}
