//! [`FeishuChannel`] -- `Channel` + `CardStream` implementation.
//!
//! Inbound events arrive over the open-platform long-connection
//! WebSocket (no public IP or webhook required); a dedup cache absorbs
//! redelivered events. Outbound text renders as interactive cards;
//! streamed turns go through the [`CardStreamManager`] which the agent
//! loop drives directly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_core::{CardStream, MessageBus};
use spanbot_types::config::ChannelSection;
use spanbot_types::error::ChannelError;
use spanbot_types::event::OutboundMessage;

use crate::traits::{Channel, ChannelFactory, ChannelStatus, MessageId, deliver_inbound};

use super::api::FeishuClient;
use super::card::{CardStreamManager, receive_id_type};
use super::markdown::build_card_elements;

/// Delay before reconnecting after a WebSocket failure.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Size of the processed-message dedup cache.
const DEDUP_CACHE_SIZE: usize = 1000;

/// Image extensions uploaded through the image API; everything else is a file.
const IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "ico", "tiff", "tif"];

/// Feishu connector with card-edit streaming.
pub struct FeishuChannel {
    client: Arc<FeishuClient>,
    cards: CardStreamManager,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
    status: Arc<RwLock<ChannelStatus>>,
    processed: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl FeishuChannel {
    /// Create a channel for the given app credentials.
    pub fn new(app_id: &str, app_secret: &str, allow_from: Vec<String>, bus: Arc<MessageBus>) -> Self {
        let client = Arc::new(FeishuClient::new(app_id, app_secret));
        Self {
            cards: CardStreamManager::new(client.clone()),
            client,
            bus,
            allow_from,
            status: Arc::new(RwLock::new(ChannelStatus::Stopped)),
            processed: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    async fn set_status(&self, status: ChannelStatus) {
        *self.status.write().await = status;
    }

    /// Record a message id; returns `false` when it was already seen.
    async fn remember(&self, message_id: &str) -> bool {
        let mut cache = self.processed.lock().await;
        if cache.1.contains(message_id) {
            return false;
        }
        cache.1.insert(message_id.to_owned());
        cache.0.push_back(message_id.to_owned());
        while cache.0.len() > DEDUP_CACHE_SIZE {
            if let Some(evicted) = cache.0.pop_front() {
                cache.1.remove(&evicted);
            }
        }
        true
    }

    /// Handle one decoded event frame from the long connection.
    async fn handle_event(&self, frame: &serde_json::Value) {
        let event_type = frame
            .pointer("/header/event_type")
            .and_then(|t| t.as_str())
            .unwrap_or("");
        if event_type != "im.message.receive_v1" {
            debug!(event_type, "skipping unhandled event type");
            return;
        }

        let event = frame.get("event").cloned().unwrap_or_default();

        // Skip echoes of our own bot messages.
        if event.pointer("/sender/sender_type").and_then(|t| t.as_str()) == Some("bot") {
            return;
        }

        let message = event.get("message").cloned().unwrap_or_default();
        let message_id = message
            .get("message_id")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_owned();
        if message_id.is_empty() || !self.remember(&message_id).await {
            return;
        }

        let sender_id = event
            .pointer("/sender/sender_id/open_id")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_owned();
        let chat_id = message
            .get("chat_id")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_owned();
        let chat_type = message
            .get("chat_type")
            .and_then(|c| c.as_str())
            .unwrap_or("p2p");
        let msg_type = message
            .get("message_type")
            .and_then(|m| m.as_str())
            .unwrap_or("");

        let raw_content = message.get("content").and_then(|c| c.as_str()).unwrap_or("{}");
        let content_json: serde_json::Value =
            serde_json::from_str(raw_content).unwrap_or_default();

        let content = match msg_type {
            "text" => content_json
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_owned(),
            other => format!("[{other}]"),
        };
        if content.is_empty() {
            return;
        }

        // Group chats reply to the chat, direct chats to the sender.
        let is_group = chat_type == "group";
        let reply_to = if is_group { chat_id } else { sender_id.clone() };

        let mut metadata = HashMap::new();
        metadata.insert("message_id".into(), serde_json::json!(message_id));
        metadata.insert("is_group".into(), serde_json::json!(is_group));

        info!(
            message_id = %metadata["message_id"],
            chat_type,
            msg_type,
            "feishu inbound accepted"
        );

        deliver_inbound(
            &self.bus,
            "feishu",
            &self.allow_from,
            &sender_id,
            &reply_to,
            &content,
            vec![],
            metadata,
        );
    }

    async fn send_media(&self, receive_id_type: &str, chat_id: &str, media: &[String]) {
        for path in media {
            if !std::path::Path::new(path).is_file() {
                warn!(path = %path, "media file not found, skipping");
                continue;
            }

            let ext = std::path::Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();

            let result = if IMAGE_EXTS.contains(&ext.as_str()) {
                match self.client.upload_image(path).await {
                    Ok(key) => self
                        .client
                        .send_message(
                            receive_id_type,
                            chat_id,
                            "image",
                            &serde_json::json!({"image_key": key}).to_string(),
                        )
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            } else {
                match self.client.upload_file(path).await {
                    Ok(key) => {
                        let media_type = if ext == "opus" { "audio" } else { "file" };
                        self.client
                            .send_message(
                                receive_id_type,
                                chat_id,
                                media_type,
                                &serde_json::json!({"file_key": key}).to_string(),
                            )
                            .await
                            .map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = result {
                error!(path = %path, error = %e, "failed to deliver media");
            }
        }
    }
}

#[async_trait]
impl Channel for FeishuChannel {
    fn name(&self) -> &str {
        "feishu"
    }

    fn status(&self) -> ChannelStatus {
        self.status
            .try_read()
            .map(|s| s.clone())
            .unwrap_or(ChannelStatus::Stopped)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        crate::traits::allow_from_matches(&self.allow_from, sender_id)
    }

    fn card_stream(self: Arc<Self>) -> Option<Arc<dyn CardStream>> {
        Some(self)
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        self.set_status(ChannelStatus::Starting).await;
        info!("Feishu channel starting with long-connection WebSocket");

        loop {
            let ws_url = match self.client.ws_endpoint().await {
                Ok(url) => url,
                Err(e) => {
                    error!(error = %e, "failed to resolve Feishu long-connection endpoint");
                    self.set_status(ChannelStatus::Error(e.to_string())).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(
                            std::time::Duration::from_secs(RECONNECT_DELAY_SECS)
                        ) => continue,
                    }
                }
            };

            let ws_stream = match tokio_tungstenite::connect_async(&ws_url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(error = %e, "failed to connect Feishu WebSocket");
                    self.set_status(ChannelStatus::Error(e.to_string())).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(
                            std::time::Duration::from_secs(RECONNECT_DELAY_SECS)
                        ) => continue,
                    }
                }
            };

            self.set_status(ChannelStatus::Running).await;
            info!("Feishu WebSocket connected");

            let (_write, mut read) = ws_stream.split();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Feishu channel received cancellation");
                        self.set_status(ChannelStatus::Stopped).await;
                        return Ok(());
                    }
                    frame = read.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<serde_json::Value>(&text) {
                                    Ok(event) => self.handle_event(&event).await,
                                    Err(_) => debug!("non-JSON frame on long connection"),
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("Feishu WebSocket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(error = %e, "Feishu WebSocket error");
                                break;
                            }
                        }
                    }
                }
            }

            self.set_status(ChannelStatus::Error("disconnected".into())).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(
                    std::time::Duration::from_secs(RECONNECT_DELAY_SECS)
                ) => info!("reconnecting Feishu WebSocket"),
            }
        }

        self.set_status(ChannelStatus::Stopped).await;
        info!("Feishu channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
        // Streamed turns are driven through CardStream, not the bus; a
        // progress-only frame is advisory and skipped.
        if msg.is_streaming() || msg.is_streaming_end() || msg.is_progress() {
            return Ok(MessageId(String::new()));
        }

        let id_type = receive_id_type(&msg.chat_id);

        if !msg.media.is_empty() {
            self.send_media(id_type, &msg.chat_id, &msg.media).await;
        }

        if msg.content.trim().is_empty() {
            return Ok(MessageId(String::new()));
        }

        let card = serde_json::json!({
            "config": {"wide_screen_mode": true},
            "elements": build_card_elements(&msg.content),
        });
        let message_id = self
            .client
            .send_message(id_type, &msg.chat_id, "interactive", &card.to_string())
            .await?;

        Ok(MessageId(message_id.unwrap_or_default()))
    }
}

#[async_trait]
impl CardStream for FeishuChannel {
    async fn start_streaming(&self, chat_id: &str) {
        self.cards.start(chat_id).await;
    }

    async fn handle_streaming_chunk(&self, chat_id: &str, text: &str, is_final: bool) {
        self.cards.handle_chunk(chat_id, text, is_final).await;
    }
}

/// Factory for [`FeishuChannel`].
pub struct FeishuChannelFactory;

impl ChannelFactory for FeishuChannelFactory {
    fn channel_name(&self) -> &str {
        "feishu"
    }

    fn build(
        &self,
        config: &ChannelSection,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let app_id = config
            .str_field("app_id")
            .ok_or_else(|| ChannelError::Other("missing 'app_id' in feishu config".into()))?;
        let app_secret = config
            .str_field("app_secret")
            .ok_or_else(|| ChannelError::Other("missing 'app_secret' in feishu config".into()))?;

        Ok(Arc::new(FeishuChannel::new(
            app_id,
            app_secret,
            config.allow_from.clone(),
            bus,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (FeishuChannel, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        (
            FeishuChannel::new("app", "secret", vec![], bus.clone()),
            bus,
        )
    }

    fn event_frame(message_id: &str, chat_type: &str, text: &str) -> serde_json::Value {
        serde_json::json!({
            "header": {"event_type": "im.message.receive_v1"},
            "event": {
                "sender": {
                    "sender_type": "user",
                    "sender_id": {"open_id": "ou_sender"},
                },
                "message": {
                    "message_id": message_id,
                    "chat_id": "oc_chat",
                    "chat_type": chat_type,
                    "message_type": "text",
                    "content": serde_json::json!({"text": text}).to_string(),
                },
            },
        })
    }

    #[tokio::test]
    async fn inbound_event_published_to_bus() {
        let (channel, bus) = channel();
        channel.handle_event(&event_frame("om_1", "group", "hello")).await;

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.channel, "feishu");
        assert_eq!(msg.sender_id, "ou_sender");
        // Group chat replies go to the chat id.
        assert_eq!(msg.chat_id, "oc_chat");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.metadata["is_group"], true);
    }

    #[tokio::test]
    async fn direct_chat_replies_to_sender() {
        let (channel, bus) = channel();
        channel.handle_event(&event_frame("om_2", "p2p", "hi")).await;

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.chat_id, "ou_sender");
    }

    #[tokio::test]
    async fn duplicate_events_dropped() {
        let (channel, bus) = channel();
        channel.handle_event(&event_frame("om_3", "p2p", "once")).await;
        channel.handle_event(&event_frame("om_3", "p2p", "once")).await;

        assert!(bus.consume_inbound().await.is_some());
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.consume_inbound())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn bot_echoes_are_skipped() {
        let (channel, bus) = channel();
        let mut frame = event_frame("om_4", "p2p", "from bot");
        frame["event"]["sender"]["sender_type"] = serde_json::json!("bot");
        channel.handle_event(&frame).await;

        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.consume_inbound())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn streaming_frames_skip_plain_send() {
        let (channel, _bus) = channel();
        let msg = OutboundMessage::new("feishu", "ou_x", "snapshot")
            .with_flag(spanbot_types::event::META_STREAMING);
        let id = channel.send(&msg).await.unwrap();
        assert!(id.0.is_empty());
    }

    #[test]
    fn factory_requires_credentials() {
        let bus = Arc::new(MessageBus::new());
        let empty = ChannelSection::default();
        assert!(FeishuChannelFactory.build(&empty, bus.clone()).is_err());

        let mut section = ChannelSection::default();
        section.extra.insert("app_id".into(), serde_json::json!("a"));
        section
            .extra
            .insert("app_secret".into(), serde_json::json!("s"));
        let channel = FeishuChannelFactory.build(&section, bus).unwrap();
        assert_eq!(channel.name(), "feishu");
        assert!(channel.supports_streaming());
    }
}
