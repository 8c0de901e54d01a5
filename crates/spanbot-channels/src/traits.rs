//! Connector trait definitions.
//!
//! [`Channel`] is implemented by each connector (Feishu, Telegram, QQ,
//! ...); [`ChannelFactory`] builds connectors from their configuration
//! section plus the shared message bus. Inbound delivery goes through
//! [`deliver_inbound`], which applies the allow-list gate before anything
//! reaches the bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use spanbot_core::{CardStream, MessageBus};
use spanbot_types::config::ChannelSection;
use spanbot_types::error::ChannelError;
use spanbot_types::event::{InboundMessage, OutboundMessage};

/// Status of a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Not yet started.
    Stopped,
    /// Currently connecting / initializing.
    Starting,
    /// Running and processing messages.
    Running,
    /// Encountered an error.
    Error(String),
}

/// Unique identifier for a sent message, returned by [`Channel::send`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

/// The trait every connector implements.
///
/// The manager drives the lifecycle: [`start`](Channel::start) is
/// long-lived and runs until the token is cancelled; `send` pushes
/// outbound messages as they are dispatched off the bus.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel identifier (e.g. `"feishu"`, `"telegram"`).
    fn name(&self) -> &str;

    /// Current lifecycle status.
    fn status(&self) -> ChannelStatus;

    /// Whether this connector can render streamed output.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Check if a sender may interact with this channel.
    fn is_allowed(&self, sender_id: &str) -> bool;

    /// Card-edit connectors hand back a [`CardStream`] handle so the
    /// agent loop can drive their streamed turns directly.
    fn card_stream(self: Arc<Self>) -> Option<Arc<dyn CardStream>> {
        None
    }

    /// Start receiving messages; runs until `cancel` is triggered.
    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError>;

    /// Send an outbound message through this channel.
    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError>;
}

/// Factory for creating [`Channel`] instances from configuration.
pub trait ChannelFactory: Send + Sync {
    /// The channel name this factory creates.
    fn channel_name(&self) -> &str;

    /// Create a connector from its config section and the shared bus.
    fn build(
        &self,
        config: &ChannelSection,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// Allow-list check shared by all connectors.
///
/// An empty list allows everyone. A sender matches when the full id is
/// listed, or — for composite ids like `"wxid|nickname"` — when any
/// `|`-separated segment is listed.
pub fn allow_from_matches(allow: &[String], sender_id: &str) -> bool {
    if allow.is_empty() {
        return true;
    }
    if allow.iter().any(|entry| entry == sender_id) {
        return true;
    }
    if sender_id.contains('|') {
        return sender_id
            .split('|')
            .filter(|part| !part.is_empty())
            .any(|part| allow.iter().any(|entry| entry == part));
    }
    false
}

/// Apply the allow-list gate, build an [`InboundMessage`], and publish it.
///
/// Disallowed senders are dropped silently apart from a debug log; no
/// disallowed message ever reaches the bus.
pub fn deliver_inbound(
    bus: &MessageBus,
    channel: &str,
    allow_from: &[String],
    sender_id: &str,
    chat_id: &str,
    content: &str,
    media: Vec<String>,
    metadata: HashMap<String, serde_json::Value>,
) {
    if !allow_from_matches(allow_from, sender_id) {
        debug!(channel, sender_id, "message blocked by allow-list");
        return;
    }

    let mut msg = InboundMessage::new(channel, sender_id, chat_id, content);
    msg.media = media;
    msg.metadata = metadata;
    bus.publish_inbound(msg);
    debug!(channel, sender_id, chat_id, "inbound message published");
}
