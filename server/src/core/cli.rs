use clap::Parser;

use super::config::StoreBackendType;
use super::constants::{
    ENV_CORS_ORIGIN, ENV_HEARTBEAT_TIMEOUT, ENV_HOST, ENV_PING_INTERVAL, ENV_PORT, ENV_REDIS_URL,
    ENV_STORE_BACKEND, ENV_WORKERS,
};

#[derive(Parser)]
#[command(name = "sockethub")]
#[command(version, about = "Scalable publish/subscribe gateway", long_about = None)]
pub struct Cli {
    /// Server host address
    #[arg(long, short = 'H', env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', env = ENV_PORT)]
    pub port: Option<u16>,

    /// Allowed CORS origin (`*` allows any)
    #[arg(long, env = ENV_CORS_ORIGIN)]
    pub cors_origin: Option<String>,

    /// Shared store URL (redis://host:port/db). Unset runs the in-memory store.
    #[arg(long, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,

    /// Store backend (memory or redis), overrides URL-based inference
    #[arg(long, env = ENV_STORE_BACKEND, value_parser = parse_store_backend)]
    pub store: Option<StoreBackendType>,

    /// Worker count hint, surfaced in cluster pings (defaults to CPU count)
    #[arg(long, env = ENV_WORKERS)]
    pub workers: Option<usize>,

    /// Heartbeat ping interval in milliseconds
    #[arg(long, env = ENV_PING_INTERVAL)]
    pub ping_interval: Option<u64>,

    /// Heartbeat timeout in milliseconds
    #[arg(long, env = ENV_HEARTBEAT_TIMEOUT)]
    pub heartbeat_timeout: Option<u64>,
}

fn parse_store_backend(s: &str) -> Result<StoreBackendType, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StoreBackendType::Memory),
        "redis" => Ok(StoreBackendType::Redis),
        other => Err(format!(
            "invalid store backend '{other}' (expected 'memory' or 'redis')"
        )),
    }
}

/// Parse command line arguments
pub fn parse() -> Cli {
    Cli::parse()
}
