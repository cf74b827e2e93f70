//! Application configuration
//!
//! Configuration is resolved once at startup from CLI flags and environment
//! variables (clap binds each flag to its env var) and passed to components
//! explicitly. No component reads the environment directly.

use super::cli::Cli;
use super::constants::{
    DEFAULT_CORS_ORIGIN, DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_HOST, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_PORT,
};

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendType {
    /// In-process store, for development and single-worker deployments
    Memory,
    /// Redis-compatible shared store, for multi-worker deployments
    Redis,
}

/// Server (HTTP + WebSocket) configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin; `*` allows any origin
    pub cors_origin: String,
}

/// Shared store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackendType,
    pub redis_url: Option<String>,
}

/// Gateway behavior configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Heartbeat ping interval in milliseconds
    pub ping_interval_ms: u64,
    /// Heartbeat timeout in milliseconds
    pub heartbeat_timeout_ms: u64,
    /// Worker count hint (informational; one process is one worker)
    pub workers: usize,
}

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Resolve configuration from parsed CLI arguments
    pub fn load(cli: &Cli) -> Self {
        let redis_url = cli.redis_url.clone();

        // Explicit backend choice wins; otherwise a configured URL means Redis.
        let backend = cli.store.unwrap_or(if redis_url.is_some() {
            StoreBackendType::Redis
        } else {
            StoreBackendType::Memory
        });

        let workers = cli.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        });

        Self {
            server: ServerConfig {
                host: cli.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: cli.port.unwrap_or(DEFAULT_PORT),
                cors_origin: cli
                    .cors_origin
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string()),
            },
            store: StoreConfig { backend, redis_url },
            gateway: GatewayConfig {
                ping_interval_ms: cli.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL_MS),
                heartbeat_timeout_ms: cli.heartbeat_timeout.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS),
                workers,
            },
        }
    }
}
