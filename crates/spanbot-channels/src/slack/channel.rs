//! [`SlackChannel`] -- Socket Mode connector for Slack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_core::MessageBus;
use spanbot_types::config::ChannelSection;
use spanbot_types::error::ChannelError;
use spanbot_types::event::OutboundMessage;

use crate::traits::{Channel, ChannelFactory, ChannelStatus, MessageId, deliver_inbound};
use crate::util::retry_send;

use super::api::SlackApiClient;

/// Delay before reconnecting after a WebSocket failure.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Slack connector using Socket Mode.
pub struct SlackChannel {
    api: SlackApiClient,
    app_token: String,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
    status: Arc<RwLock<ChannelStatus>>,
}

impl SlackChannel {
    /// Create a channel from bot + app tokens.
    pub fn new(bot_token: &str, app_token: &str, allow_from: Vec<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            api: SlackApiClient::new(bot_token),
            app_token: app_token.to_owned(),
            bus,
            allow_from,
            status: Arc::new(RwLock::new(ChannelStatus::Stopped)),
        }
    }

    async fn set_status(&self, status: ChannelStatus) {
        *self.status.write().await = status;
    }

    /// Process one Socket Mode envelope; returns the acknowledgement.
    async fn process_envelope(&self, envelope: &Value) -> Option<Value> {
        let envelope_id = envelope
            .get("envelope_id")
            .and_then(|i| i.as_str())
            .map(str::to_owned);
        let ack = envelope_id.map(|id| json!({"envelope_id": id}));

        if envelope.get("type").and_then(|t| t.as_str()) != Some("events_api") {
            debug!("skipping non-events_api envelope");
            return ack;
        }

        let Some(event) = envelope.pointer("/payload/event") else {
            return ack;
        };

        // Skip bot echoes to avoid loops.
        if event.get("bot_id").is_some() {
            debug!("skipping bot message");
            return ack;
        }

        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if !matches!(event_type, "message" | "app_mention") {
            debug!(event_type, "skipping unhandled event type");
            return ack;
        }

        let Some(text) = event.get("text").and_then(|t| t.as_str()) else {
            return ack;
        };
        let sender_id = event.get("user").and_then(|u| u.as_str()).unwrap_or("");
        let channel_id = event.get("channel").and_then(|c| c.as_str()).unwrap_or("");

        let mut metadata = HashMap::new();
        if let Some(ts) = event.get("ts").and_then(|t| t.as_str()) {
            metadata.insert("message_id".into(), json!(ts));
        }
        if let Some(thread_ts) = event.get("thread_ts").and_then(|t| t.as_str()) {
            metadata.insert("thread_ts".into(), json!(thread_ts));
        }
        let channel_type = event.get("channel_type").and_then(|c| c.as_str());
        metadata.insert("is_group".into(), json!(channel_type != Some("im")));

        deliver_inbound(
            &self.bus,
            "slack",
            &self.allow_from,
            sender_id,
            channel_id,
            text,
            vec![],
            metadata,
        );

        ack
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn status(&self) -> ChannelStatus {
        self.status
            .try_read()
            .map(|s| s.clone())
            .unwrap_or(ChannelStatus::Stopped)
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        crate::traits::allow_from_matches(&self.allow_from, sender_id)
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        self.set_status(ChannelStatus::Starting).await;
        info!("Slack channel starting in Socket Mode");

        loop {
            let ws_url = match self.api.apps_connections_open(&self.app_token).await {
                Ok(url) => url,
                Err(e) => {
                    error!(error = %e, "failed to obtain Slack WebSocket URL");
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
                    error!(error = %e, "failed to connect Slack WebSocket");
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
            info!("Slack WebSocket connected");
            let (mut write, mut read) = ws_stream.split();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Slack channel received cancellation");
                        let _ = write.close().await;
                        self.set_status(ChannelStatus::Stopped).await;
                        return Ok(());
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<Value>(&text) {
                                    Ok(envelope) => {
                                        if let Some(ack) = self.process_envelope(&envelope).await
                                            && let Err(e) = write
                                                .send(WsMessage::Text(ack.to_string().into()))
                                                .await
                                        {
                                            warn!(error = %e, "failed to send acknowledge");
                                        }
                                    }
                                    Err(_) => debug!("received non-envelope message"),
                                }
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                let _ = write.send(WsMessage::Pong(data)).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("Slack WebSocket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(error = %e, "Slack WebSocket error");
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
                ) => info!("reconnecting Slack WebSocket"),
            }
        }

        self.set_status(ChannelStatus::Stopped).await;
        info!("Slack channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
        if msg.is_streaming() || msg.is_streaming_end() || msg.is_progress() {
            return Ok(MessageId(String::new()));
        }
        if msg.content.trim().is_empty() {
            return Ok(MessageId(String::new()));
        }

        let thread_ts = msg
            .metadata
            .get("thread_ts")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        let ts = retry_send("chat.postMessage", || {
            self.api
                .chat_post_message(&msg.chat_id, &msg.content, thread_ts.as_deref())
        })
        .await?;
        Ok(MessageId(ts))
    }
}

/// Factory for [`SlackChannel`].
pub struct SlackChannelFactory;

impl ChannelFactory for SlackChannelFactory {
    fn channel_name(&self) -> &str {
        "slack"
    }

    fn build(
        &self,
        config: &ChannelSection,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let bot_token = config
            .str_field("bot_token")
            .ok_or_else(|| ChannelError::Other("missing 'bot_token' in slack config".into()))?;
        let app_token = config
            .str_field("app_token")
            .ok_or_else(|| ChannelError::Other("missing 'app_token' in slack config".into()))?;

        Ok(Arc::new(SlackChannel::new(
            bot_token,
            app_token,
            config.allow_from.clone(),
            bus,
        )))
    }
}
