//! HTTP and WebSocket surface

mod routes;
mod server;
mod ws;

use std::sync::Arc;
use std::time::Instant;

pub use server::ApiServer;

use crate::cluster::ClusterBridge;
use crate::gateway::ConnectionSupervisor;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub cluster: Option<Arc<ClusterBridge>>,
    pub started_at: Instant,
}
