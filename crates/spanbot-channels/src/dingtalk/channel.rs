//! [`DingTalkChannel`] -- stream-mode connector for DingTalk.
//!
//! The stream-mode handshake trades app credentials for a WebSocket
//! endpoint + ticket; inbound chatbot callbacks arrive as JSON frames
//! that must be acknowledged by `messageId`. Replies go out through the
//! one-to-one robot batch-send API as markdown. Only private (1:1) chat
//! is supported: group messages are received but answered in private.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_core::MessageBus;
use spanbot_types::config::ChannelSection;
use spanbot_types::error::ChannelError;
use spanbot_types::event::OutboundMessage;

use crate::traits::{Channel, ChannelFactory, ChannelStatus, MessageId, deliver_inbound};
use crate::util::retry_send;

/// Refresh the cached token this long before its reported expiry.
const TOKEN_EARLY_REFRESH: Duration = Duration::from_secs(60);

/// Delay before reconnecting the stream-mode socket.
const RECONNECT_DELAY_SECS: u64 = 5;

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// DingTalk stream-mode connector.
pub struct DingTalkChannel {
    http: Client,
    client_id: String,
    client_secret: String,
    api_url: String,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
    status: Arc<RwLock<ChannelStatus>>,
    token: Mutex<Option<CachedToken>>,
}

impl DingTalkChannel {
    /// Create a channel for the given app credentials.
    pub fn new(client_id: &str, client_secret: &str, allow_from: Vec<String>, bus: Arc<MessageBus>) -> Self {
        Self::with_api_url(
            client_id,
            client_secret,
            "https://api.dingtalk.com".into(),
            allow_from,
            bus,
        )
    }

    /// Create a channel against a custom API base (for testing).
    pub fn with_api_url(
        client_id: &str,
        client_secret: &str,
        api_url: String,
        allow_from: Vec<String>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            http: Client::new(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            api_url,
            bus,
            allow_from,
            status: Arc::new(RwLock::new(ChannelStatus::Stopped)),
            token: Mutex::new(None),
        }
    }

    async fn set_status(&self, status: ChannelStatus) {
        *self.status.write().await = status;
    }

    /// Fetch or reuse the access token.
    async fn access_token(&self) -> Result<String, ChannelError> {
        {
            let cached = self.token.lock().await;
            if let Some(token) = cached.as_ref()
                && Instant::now() < token.expires_at
            {
                return Ok(token.token.clone());
            }
        }

        let body: Value = self
            .http
            .post(format!("{}/v1.0/oauth2/accessToken", self.api_url))
            .json(&json!({"appKey": self.client_id, "appSecret": self.client_secret}))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::AuthFailed(e.to_string()))?;

        let token = body
            .get("accessToken")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChannelError::AuthFailed("missing accessToken".into()))?
            .to_owned();
        let expire = body.get("expireIn").and_then(|e| e.as_u64()).unwrap_or(7200);

        *self.token.lock().await = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now()
                + Duration::from_secs(expire).saturating_sub(TOKEN_EARLY_REFRESH),
        });
        Ok(token)
    }

    /// Open a stream-mode connection and return the WebSocket URL.
    async fn open_connection(&self) -> Result<String, ChannelError> {
        let body: Value = self
            .http
            .post(format!("{}/v1.0/gateway/connections/open", self.api_url))
            .json(&json!({
                "clientId": self.client_id,
                "clientSecret": self.client_secret,
                "subscriptions": [
                    {"type": "CALLBACK", "topic": "/v1.0/im/bot/messages/get"},
                ],
            }))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let endpoint = body.get("endpoint").and_then(|e| e.as_str());
        let ticket = body.get("ticket").and_then(|t| t.as_str());
        match (endpoint, ticket) {
            (Some(endpoint), Some(ticket)) => Ok(format!("{endpoint}?ticket={ticket}")),
            _ => Err(ChannelError::ConnectionFailed(
                "stream connection response missing endpoint/ticket".into(),
            )),
        }
    }

    /// Handle one chatbot callback frame; returns the ack to send back.
    async fn handle_frame(&self, frame: &Value) -> Option<Value> {
        let message_id = frame
            .pointer("/headers/messageId")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_owned();
        let topic = frame
            .pointer("/headers/topic")
            .and_then(|t| t.as_str())
            .unwrap_or("");

        if topic != "/v1.0/im/bot/messages/get" {
            debug!(topic, "skipping non-chatbot frame");
            return ack(&message_id);
        }

        let data: Value = frame
            .get("data")
            .and_then(|d| d.as_str())
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let content = data
            .pointer("/text/content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
        let sender_id = data
            .get("senderStaffId")
            .or_else(|| data.get("senderId"))
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_owned();
        let sender_name = data
            .get("senderNick")
            .and_then(|s| s.as_str())
            .unwrap_or("Unknown");

        if content.is_empty() || sender_id.is_empty() {
            warn!("dingtalk frame without text content, acknowledging anyway");
            return ack(&message_id);
        }

        info!(sender = %sender_name, "dingtalk inbound message");

        let mut metadata = HashMap::new();
        metadata.insert("sender_name".into(), json!(sender_name));
        metadata.insert("message_id".into(), json!(message_id));

        // Private chat only: the reply target is the sender.
        deliver_inbound(
            &self.bus,
            "dingtalk",
            &self.allow_from,
            &sender_id,
            &sender_id,
            &content,
            vec![],
            metadata,
        );

        ack(&message_id)
    }

    async fn send_markdown(&self, staff_id: &str, text: &str) -> Result<(), ChannelError> {
        let token = self.access_token().await?;

        let body = json!({
            "robotCode": self.client_id,
            "userIds": [staff_id],
            "msgKey": "sampleMarkdown",
            "msgParam": json!({"text": text, "title": "Reply"}).to_string(),
        });

        let response = self
            .http
            .post(format!("{}/v1.0/robot/oToMessages/batchSend", self.api_url))
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed(format!("batchSend: {text}")));
        }
        Ok(())
    }
}

fn ack(message_id: &str) -> Option<Value> {
    if message_id.is_empty() {
        return None;
    }
    Some(json!({
        "code": 200,
        "headers": {"messageId": message_id, "contentType": "application/json"},
        "message": "OK",
        "data": "{}",
    }))
}

#[async_trait]
impl Channel for DingTalkChannel {
    fn name(&self) -> &str {
        "dingtalk"
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
        info!("DingTalk channel starting in stream mode");

        loop {
            let ws_url = match self.open_connection().await {
                Ok(url) => url,
                Err(e) => {
                    error!(error = %e, "failed to open DingTalk stream connection");
                    self.set_status(ChannelStatus::Error(e.to_string())).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(
                            Duration::from_secs(RECONNECT_DELAY_SECS)
                        ) => continue,
                    }
                }
            };

            let stream = match tokio_tungstenite::connect_async(&ws_url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(error = %e, "failed to connect DingTalk WebSocket");
                    self.set_status(ChannelStatus::Error(e.to_string())).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(
                            Duration::from_secs(RECONNECT_DELAY_SECS)
                        ) => continue,
                    }
                }
            };

            self.set_status(ChannelStatus::Running).await;
            info!("DingTalk stream connected");
            let (mut write, mut read) = stream.split();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = write.close().await;
                        self.set_status(ChannelStatus::Stopped).await;
                        return Ok(());
                    }
                    frame = read.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                    if let Some(response) = self.handle_frame(&value).await
                                        && let Err(e) = write
                                            .send(WsMessage::Text(response.to_string().into()))
                                            .await
                                    {
                                        warn!(error = %e, "failed to acknowledge frame");
                                    }
                                } else {
                                    debug!("non-JSON stream frame");
                                }
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                let _ = write.send(WsMessage::Pong(data)).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("DingTalk stream closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(error = %e, "DingTalk stream error");
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
                    Duration::from_secs(RECONNECT_DELAY_SECS)
                ) => info!("reconnecting DingTalk stream"),
            }
        }

        self.set_status(ChannelStatus::Stopped).await;
        info!("DingTalk channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
        if msg.is_streaming() || msg.is_streaming_end() || msg.is_progress() {
            return Ok(MessageId(String::new()));
        }
        if msg.content.trim().is_empty() {
            return Ok(MessageId(String::new()));
        }

        retry_send("dingtalk batchSend", || {
            self.send_markdown(&msg.chat_id, &msg.content)
        })
        .await?;
        Ok(MessageId(String::new()))
    }
}

/// Factory for [`DingTalkChannel`].
pub struct DingTalkChannelFactory;

impl ChannelFactory for DingTalkChannelFactory {
    fn channel_name(&self) -> &str {
        "dingtalk"
    }

    fn build(
        &self,
        config: &ChannelSection,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let client_id = config
            .str_field("client_id")
            .ok_or_else(|| ChannelError::Other("missing 'client_id' in dingtalk config".into()))?;
        let client_secret = config.str_field("client_secret").ok_or_else(|| {
            ChannelError::Other("missing 'client_secret' in dingtalk config".into())
        })?;

        Ok(Arc::new(DingTalkChannel::new(
            client_id,
            client_secret,
            config.allow_from.clone(),
            bus,
        )))
    }
}
