//! Message event types for the channel bus.
//!
//! [`InboundMessage`] represents user input arriving from a channel,
//! while [`OutboundMessage`] represents agent responses heading back out.
//!
//! Streaming fan-out is signalled through well-known metadata flags on
//! [`OutboundMessage`]: a mid-stream snapshot carries [`META_STREAMING`]
//! (and usually [`META_PROGRESS`]), and the empty terminator that closes a
//! streamed turn carries [`META_STREAMING_END`]. Mid-stream snapshots
//! always hold the *cumulative* text for the turn, never a delta.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key marking a mid-stream snapshot.
pub const META_STREAMING: &str = "_streaming";

/// Metadata key marking the terminator of a streamed turn.
pub const META_STREAMING_END: &str = "_streaming_end";

/// Metadata key marking an advisory progress message.
///
/// Progress messages are not user-visible unless a connector opts in.
pub const META_PROGRESS: &str = "_progress";

/// An inbound message received from a chat channel.
///
/// Carries the raw user input plus channel-specific metadata.
/// Use [`session_key`](InboundMessage::session_key) to derive a stable
/// session identifier from the channel + chat_id pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "feishu", "qq").
    pub channel: String,

    /// Sender identifier within the channel.
    pub sender_id: String,

    /// Chat / conversation identifier within the channel; the reply target.
    pub chat_id: String,

    /// Message text content.
    pub content: String,

    /// When the message was received.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Local filesystem paths of attached media.
    #[serde(default)]
    pub media: Vec<String>,

    /// Arbitrary channel-specific metadata (`message_id`, `is_group`, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    /// Build a plain text inbound message with empty media and metadata.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Unique key for session identification: `"{channel}:{chat_id}"`.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// An outbound message to send to a chat channel.
///
/// Produced by the agent pipeline and dispatched to the appropriate
/// channel connector by the channel manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,

    /// Target chat / conversation identifier.
    pub chat_id: String,

    /// Message text content.
    pub content: String,

    /// Optional message ID to reply to.
    #[serde(default)]
    pub reply_to: Option<String>,

    /// Local filesystem paths of attached media.
    #[serde(default)]
    pub media: Vec<String>,

    /// Arbitrary channel-specific metadata and control flags.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    /// Build a plain text outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set a metadata flag to `true`.
    pub fn with_flag(mut self, key: &str) -> Self {
        self.metadata.insert(key.to_owned(), serde_json::json!(true));
        self
    }

    fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Whether this message is a mid-stream snapshot.
    pub fn is_streaming(&self) -> bool {
        self.flag(META_STREAMING)
    }

    /// Whether this message terminates a streamed turn.
    pub fn is_streaming_end(&self) -> bool {
        self.flag(META_STREAMING_END)
    }

    /// Whether this message is advisory progress output.
    pub fn is_progress(&self) -> bool {
        self.flag(META_PROGRESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_session_key() {
        let msg = InboundMessage::new("telegram", "user123", "chat456", "hello");
        assert_eq!(msg.session_key(), "telegram:chat456");
    }

    #[test]
    fn inbound_serde_roundtrip() {
        let mut msg = InboundMessage::new("slack", "U12345", "C67890", "test message");
        msg.media.push("/tmp/image.png".into());
        msg.metadata
            .insert("thread_ts".into(), serde_json::json!("123.456"));

        let json = serde_json::to_string(&msg).unwrap();
        let restored: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.channel, "slack");
        assert_eq!(restored.sender_id, "U12345");
        assert_eq!(restored.content, "test message");
        assert_eq!(restored.media.len(), 1);
        assert!(restored.metadata.contains_key("thread_ts"));
    }

    #[test]
    fn inbound_defaults_on_missing_fields() {
        let json = r#"{
            "channel": "qq",
            "sender_id": "u1",
            "chat_id": "c1",
            "content": "hi"
        }"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(msg.media.is_empty());
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn outbound_serde_roundtrip() {
        let mut msg = OutboundMessage::new("telegram", "chat456", "reply");
        msg.reply_to = Some("msg789".into());

        let json = serde_json::to_string(&msg).unwrap();
        let restored: OutboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.channel, "telegram");
        assert_eq!(restored.reply_to.as_deref(), Some("msg789"));
    }

    #[test]
    fn streaming_flags_default_false() {
        let msg = OutboundMessage::new("feishu", "c1", "partial");
        assert!(!msg.is_streaming());
        assert!(!msg.is_streaming_end());
        assert!(!msg.is_progress());
    }

    #[test]
    fn streaming_flags_set() {
        let msg = OutboundMessage::new("feishu", "c1", "partial")
            .with_flag(META_STREAMING)
            .with_flag(META_PROGRESS);
        assert!(msg.is_streaming());
        assert!(msg.is_progress());
        assert!(!msg.is_streaming_end());
    }

    #[test]
    fn terminator_shape() {
        let msg = OutboundMessage::new("telegram", "c1", "").with_flag(META_STREAMING_END);
        assert!(msg.is_streaming_end());
        assert!(msg.content.is_empty());
    }

    #[test]
    fn non_boolean_flag_ignored() {
        let mut msg = OutboundMessage::new("qq", "c1", "x");
        msg.metadata
            .insert(META_STREAMING.into(), serde_json::json!("yes"));
        assert!(!msg.is_streaming());
    }
}
