//! Wire protocol types
//!
//! JSON frames exchanged with clients over the connection sink, plus the
//! broadcast envelope persisted to the store and flattened into stream
//! entries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::constants::{CHANNEL_NAME_MAX_LEN, GLOBAL_CHANNEL};

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Validate a channel name: `*` (the global channel) or
/// `[A-Za-z0-9_.-]{1,100}`
pub fn is_valid_channel(name: &str) -> bool {
    if name == GLOBAL_CHANNEL {
        return true;
    }
    !name.is_empty()
        && name.len() <= CHANNEL_NAME_MAX_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

// ============================================================================
// BROADCAST ENVELOPE
// ============================================================================

/// A published message as persisted under `message:{id}` and carried in
/// stream entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub message_id: String,
    pub channel: String,
    pub data: Value,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl BroadcastMessage {
    pub fn new(channel: &str, data: Value, sender_id: Option<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            data,
            timestamp: now_ms(),
            sender_id,
        }
    }

    /// Flatten into string fields for a stream entry
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("messageId".to_string(), self.message_id.clone()),
            ("channel".to_string(), self.channel.clone()),
            ("data".to_string(), self.data.to_string()),
            ("timestamp".to_string(), self.timestamp.to_string()),
        ];
        if let Some(sender) = &self.sender_id {
            fields.push(("senderId".to_string(), sender.clone()));
        }
        fields
    }

    /// Rebuild from a stream entry's field map
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let message_id = fields.get("messageId")?.clone();
        let channel = fields.get("channel")?.clone();
        let data = serde_json::from_str(fields.get("data")?).ok()?;
        let timestamp = fields.get("timestamp")?.parse().ok()?;
        Some(Self {
            message_id,
            channel,
            data,
            timestamp,
            sender_id: fields.get("senderId").cloned(),
        })
    }
}

// ============================================================================
// CLIENT → SERVER
// ============================================================================

/// Commands a client may send over the sink
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Subscribe {
        channel: String,
        message_id: Option<String>,
    },
    Unsubscribe {
        channel: String,
        message_id: Option<String>,
    },
    Broadcast {
        /// Defaults to the global channel
        channel: Option<String>,
        data: Value,
        message_id: Option<String>,
    },
    /// Client confirmation that a delivered message was processed
    Ack { message_id: String },
}

// ============================================================================
// SERVER → CLIENT
// ============================================================================

/// Frames the server sends over the sink
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: i64,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        timestamp: i64,
    },
    Error {
        data: ErrorData,
        timestamp: i64,
    },
    Ping {
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub error: String,
}

impl ServerFrame {
    /// A delivered broadcast message
    pub fn message(envelope: &BroadcastMessage) -> Self {
        Self::Message {
            channel: Some(envelope.channel.clone()),
            data: envelope.data.clone(),
            message_id: Some(envelope.message_id.clone()),
            timestamp: envelope.timestamp,
        }
    }

    /// The welcome frame sent right after accept
    pub fn welcome(connection_id: &str, session_id: &str, stream_name: &str) -> Self {
        Self::Message {
            channel: None,
            data: serde_json::json!({
                "type": "welcome",
                "connectionId": connection_id,
                "sessionId": session_id,
                "streamName": stream_name,
                "serverTime": now_ms(),
            }),
            message_id: None,
            timestamp: now_ms(),
        }
    }

    pub fn ack(message_id: Option<String>, data: Option<Value>) -> Self {
        Self::Ack {
            message_id,
            data,
            timestamp: now_ms(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            data: ErrorData {
                error: message.into(),
            },
            timestamp: now_ms(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_ms(),
        }
    }

    /// Serialize to the wire representation
    pub fn to_json(&self) -> String {
        // ServerFrame contains only JSON-representable types
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_validation() {
        assert!(is_valid_channel("*"));
        assert!(is_valid_channel("news"));
        assert!(is_valid_channel("room_1.sub-topic"));
        assert!(is_valid_channel(&"a".repeat(100)));
        assert!(!is_valid_channel(""));
        assert!(!is_valid_channel(&"a".repeat(101)));
        assert!(!is_valid_channel("has space"));
        assert!(!is_valid_channel("emoji🎉"));
        assert!(!is_valid_channel("colon:separated"));
    }

    #[test]
    fn test_parse_subscribe_command() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"subscribe","channel":"c","messageId":"m1"}"#).unwrap();
        match cmd {
            ClientCommand::Subscribe {
                channel,
                message_id,
            } => {
                assert_eq!(channel, "c");
                assert_eq!(message_id.as_deref(), Some("m1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_broadcast_defaults() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"broadcast","data":{"x":1}}"#).unwrap();
        match cmd {
            ClientCommand::Broadcast {
                channel,
                data,
                message_id,
            } => {
                assert!(channel.is_none());
                assert_eq!(data, serde_json::json!({"x": 1}));
                assert!(message_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let result = serde_json::from_str::<ClientCommand>(r#"{"type":"shout","data":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_message_frame_shape() {
        let envelope = BroadcastMessage {
            message_id: "mid".to_string(),
            channel: "c".to_string(),
            data: serde_json::json!({"x": 1}),
            timestamp: 123,
            sender_id: None,
        };
        let value: Value =
            serde_json::from_str(&ServerFrame::message(&envelope).to_json()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["channel"], "c");
        assert_eq!(value["messageId"], "mid");
        assert_eq!(value["data"]["x"], 1);
        assert_eq!(value["timestamp"], 123);
    }

    #[test]
    fn test_welcome_frame_shape() {
        let value: Value =
            serde_json::from_str(&ServerFrame::welcome("conn1", "sess1", "u1").to_json()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["type"], "welcome");
        assert_eq!(value["data"]["connectionId"], "conn1");
        assert_eq!(value["data"]["sessionId"], "sess1");
        assert_eq!(value["data"]["streamName"], "u1");
        assert!(value["data"]["serverTime"].is_i64());
        // No channel or messageId on the welcome frame
        assert!(value.get("channel").is_none());
        assert!(value.get("messageId").is_none());
    }

    #[test]
    fn test_ack_frame_shape() {
        let frame = ServerFrame::ack(
            Some("m2".to_string()),
            Some(serde_json::json!({"broadcastMessageId": "b1"})),
        );
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["messageId"], "m2");
        assert_eq!(value["data"]["broadcastMessageId"], "b1");
    }

    #[test]
    fn test_error_frame_shape() {
        let value: Value =
            serde_json::from_str(&ServerFrame::error("Invalid channel name").to_json()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["error"], "Invalid channel name");
    }

    #[test]
    fn test_envelope_field_round_trip() {
        let envelope = BroadcastMessage::new("c", serde_json::json!({"x": 1}), Some("s1".into()));
        let fields: HashMap<String, String> = envelope.to_fields().into_iter().collect();
        let parsed = BroadcastMessage::from_fields(&fields).unwrap();
        assert_eq!(parsed.message_id, envelope.message_id);
        assert_eq!(parsed.channel, "c");
        assert_eq!(parsed.data, envelope.data);
        assert_eq!(parsed.timestamp, envelope.timestamp);
        assert_eq!(parsed.sender_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_envelope_from_fields_missing_required() {
        let mut fields: HashMap<String, String> = HashMap::new();
        fields.insert("channel".to_string(), "c".to_string());
        assert!(BroadcastMessage::from_fields(&fields).is_none());
    }
}
