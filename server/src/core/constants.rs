// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "SocketHub";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "sockethub";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "PORT";

/// Environment variable for allowed CORS origin (`*` allows any)
pub const ENV_CORS_ORIGIN: &str = "CORS_ORIGIN";

/// Environment variable for the shared store URL
pub const ENV_REDIS_URL: &str = "REDIS_URL";

/// Environment variable forcing a store backend (`memory` or `redis`)
pub const ENV_STORE_BACKEND: &str = "SOCKETHUB_STORE";

/// Environment variable for the worker count hint
pub const ENV_WORKERS: &str = "WORKERS";

/// Environment variable for the heartbeat ping interval (milliseconds)
pub const ENV_PING_INTERVAL: &str = "PING_INTERVAL";

/// Environment variable for the heartbeat timeout (milliseconds)
pub const ENV_HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "SOCKETHUB_LOG";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port
pub const DEFAULT_PORT: u16 = 8080;

/// Default CORS origin
pub const DEFAULT_CORS_ORIGIN: &str = "*";

/// Default heartbeat ping interval in milliseconds
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;

/// Default heartbeat timeout in milliseconds
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

// =============================================================================
// Store Key Layout
// =============================================================================

/// Prefix for every key this service writes to the shared store
pub const STORE_KEY_PREFIX: &str = "sockets:";

/// TTL for persisted message envelopes (seconds)
pub const MESSAGE_TTL_SECS: u64 = 3600;

/// TTL for persisted per-session subscription sets (seconds)
pub const SUBSCRIPTION_TTL_SECS: u64 = 3600;

/// TTL for publish counters (seconds)
pub const STATS_TTL_SECS: u64 = 3600;

/// TTL for data streams (seconds)
pub const STREAM_TTL_SECS: u64 = 3600;

/// TTL for session hashes and their reverse index (seconds)
pub const SESSION_TTL_SECS: u64 = 86_400;

/// TTL for delivered-entry ack bookkeeping (seconds)
pub const ACK_RECORD_TTL_SECS: u64 = 600;

// =============================================================================
// Streams
// =============================================================================

/// Approximate max length for data streams (XADD MAXLEN ~)
pub const STREAM_MAX_LEN: u64 = 20;

/// Entries older than this are trimmed and auto-acked (seconds)
pub const STREAM_ENTRY_MAX_AGE_SECS: u64 = 600;

/// Interval between MINID trim sweeps over all data streams (seconds)
pub const STREAM_SWEEP_INTERVAL_SECS: u64 = 300;

/// Block timeout for consumer-group reads (milliseconds)
pub const XREAD_BLOCK_MS: u64 = 1000;

/// Max entries delivered to one session per poll tick
pub const READ_BATCH_MAX: usize = 10;

/// Cap on pending entries drained per stream before reading new ones
pub const PENDING_DRAIN_CAP: usize = 5;

/// Minimum idle time before claiming another consumer's pending entry
/// (milliseconds)
pub const CLAIM_MIN_IDLE_MS: u64 = 60_000;

// =============================================================================
// Delivery Loop
// =============================================================================

/// Poll-and-deliver tick interval (milliseconds)
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Dedup cache entry lifetime (seconds)
pub const DEDUP_TTL_SECS: u64 = 60;

/// Dedup cache capacity (message ids)
pub const DEDUP_MAX_ENTRIES: u64 = 100_000;

// =============================================================================
// Sessions
// =============================================================================

/// Session identity used when the client supplies no `streamName`
pub const DEFAULT_STREAM_NAME: &str = "default";

/// Sessions idle longer than this are deleted by the sweep (seconds)
pub const SESSION_MAX_IDLE_SECS: u64 = 86_400;

/// Grace window before a session with zero connections is deleted (seconds)
pub const SESSION_EMPTY_GRACE_SECS: u64 = 300;

/// Interval between session cleanup sweeps (seconds)
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 1800;

// =============================================================================
// Channels
// =============================================================================

/// The global channel name
pub const GLOBAL_CHANNEL: &str = "*";

/// Maximum channel name length
pub const CHANNEL_NAME_MAX_LEN: usize = 100;

/// Maximum serialized size of a client broadcast payload (bytes)
pub const MAX_BROADCAST_DATA_BYTES: usize = 64 * 1024;

// =============================================================================
// Rate Limiting
// =============================================================================

/// Accepted connections per source address per window
pub const CONNECT_RATE_LIMIT: u32 = 100;

/// Rate limit window in seconds
pub const CONNECT_RATE_WINDOW_SECS: u64 = 60;

// =============================================================================
// Close Codes
// =============================================================================

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Server is shutting down
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Policy violation (rate limited)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Internal server error
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

// =============================================================================
// Cluster
// =============================================================================

/// Pub/sub channel carrying inter-worker control messages
pub const CLUSTER_CONTROL_CHANNEL: &str = "sockets:cluster:control";

/// Interval between worker health pings (seconds)
pub const CLUSTER_PING_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Misc
// =============================================================================

/// Default limit for message history lookups
pub const MESSAGE_HISTORY_LIMIT: usize = 50;

/// Max time to wait for background tasks during shutdown (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
