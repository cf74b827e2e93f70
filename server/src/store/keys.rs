//! Store key builder
//!
//! Every key this service writes goes through this builder so the layout
//! stays bit-stable across workers. Data streams live under
//! `sockets:stream:*`; the session reverse index deliberately uses the
//! disjoint `sockets:streamname:*` namespace so a stream sweep can scan
//! `sockets:stream:*` without touching session state.

use crate::core::constants::{GLOBAL_CHANNEL, STORE_KEY_PREFIX};

/// Store key builder
pub struct StoreKey;

impl StoreKey {
    // =========================================================================
    // Messages and stats
    // =========================================================================

    /// Persisted message envelope
    pub fn message(message_id: &str) -> String {
        format!("{STORE_KEY_PREFIX}message:{message_id}")
    }

    /// Scan pattern for all persisted envelopes
    pub fn message_pattern() -> String {
        format!("{STORE_KEY_PREFIX}message:*")
    }

    /// Global publish counter
    pub fn stats_total_messages() -> String {
        format!("{STORE_KEY_PREFIX}stats:total_messages")
    }

    /// Per-channel publish counter
    pub fn stats_channel_messages(channel: &str) -> String {
        format!("{STORE_KEY_PREFIX}stats:channel:{channel}:messages")
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Data stream carrying a channel's messages (`*` maps to the global stream)
    pub fn stream_for(channel: &str) -> String {
        if channel == GLOBAL_CHANNEL {
            Self::stream_global()
        } else {
            Self::stream_channel(channel)
        }
    }

    /// The global data stream
    pub fn stream_global() -> String {
        format!("{STORE_KEY_PREFIX}stream:global")
    }

    /// A per-channel data stream
    pub fn stream_channel(channel: &str) -> String {
        format!("{STORE_KEY_PREFIX}stream:channel:{channel}")
    }

    /// Scan pattern matching every data stream (and nothing else)
    pub fn stream_pattern() -> String {
        format!("{STORE_KEY_PREFIX}stream:*")
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Session hash
    pub fn session(session_id: &str) -> String {
        format!("{STORE_KEY_PREFIX}session:{session_id}")
    }

    /// Scan pattern for all session hashes
    pub fn session_pattern() -> String {
        format!("{STORE_KEY_PREFIX}session:*")
    }

    /// Reverse index from a client-chosen stream name to its session id
    pub fn stream_name(stream_name: &str) -> String {
        format!("{STORE_KEY_PREFIX}streamname:{stream_name}")
    }

    // =========================================================================
    // Per-session client state
    // =========================================================================

    /// Persisted subscription set for a session
    pub fn client_subscriptions(session_id: &str) -> String {
        format!("{STORE_KEY_PREFIX}client:{session_id}:subscriptions")
    }

    /// Delivered-entry record awaiting a client acknowledgment
    pub fn client_ack(session_id: &str, message_id: &str) -> String {
        format!("{STORE_KEY_PREFIX}client:{session_id}:ack:{message_id}")
    }

    /// Scan pattern for a session's outstanding ack records
    pub fn client_ack_pattern(session_id: &str) -> String {
        format!("{STORE_KEY_PREFIX}client:{session_id}:ack:*")
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    /// Accept-time rate limit counter (not under the service prefix; counter
    /// semantics are shared with any co-located services)
    pub fn rate_limit(bucket: &str, identifier: &str) -> String {
        format!("rl:{bucket}:{identifier}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_keys() {
        assert_eq!(StoreKey::message("abc"), "sockets:message:abc");
        assert_eq!(StoreKey::message_pattern(), "sockets:message:*");
    }

    #[test]
    fn test_stats_keys() {
        assert_eq!(
            StoreKey::stats_total_messages(),
            "sockets:stats:total_messages"
        );
        assert_eq!(
            StoreKey::stats_channel_messages("news"),
            "sockets:stats:channel:news:messages"
        );
    }

    #[test]
    fn test_stream_keys() {
        assert_eq!(StoreKey::stream_global(), "sockets:stream:global");
        assert_eq!(
            StoreKey::stream_channel("news"),
            "sockets:stream:channel:news"
        );
        assert_eq!(StoreKey::stream_for("*"), "sockets:stream:global");
        assert_eq!(StoreKey::stream_for("news"), "sockets:stream:channel:news");
    }

    #[test]
    fn test_session_namespace_disjoint_from_streams() {
        let session_index = StoreKey::stream_name("u1");
        assert_eq!(session_index, "sockets:streamname:u1");
        // The stream sweep scans this pattern; the session index must not match.
        assert!(!session_index.starts_with("sockets:stream:"));
    }

    #[test]
    fn test_client_keys() {
        assert_eq!(
            StoreKey::client_subscriptions("s1"),
            "sockets:client:s1:subscriptions"
        );
        assert_eq!(StoreKey::client_ack("s1", "m1"), "sockets:client:s1:ack:m1");
        assert_eq!(
            StoreKey::client_ack_pattern("s1"),
            "sockets:client:s1:ack:*"
        );
    }

    #[test]
    fn test_rate_limit_key() {
        assert_eq!(
            StoreKey::rate_limit("connect", "192.168.1.1"),
            "rl:connect:192.168.1.1"
        );
    }
}
