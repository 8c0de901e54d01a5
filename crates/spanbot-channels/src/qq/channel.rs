//! [`QqChannel`] -- `Channel` trait implementation for QQ.
//!
//! The gateway protocol is opcode-based: the server sends `10` (hello)
//! with a heartbeat interval, the client identifies with `2`, keeps the
//! connection alive with `1` heartbeats, and receives `0` dispatches
//! (`C2C_MESSAGE_CREATE` for direct messages).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
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
use crate::util::{chunk_text, retry_send};

use super::api::QqApiClient;

/// QQ's practical per-message character limit.
const MAX_MESSAGE_CHARS: usize = 1500;

/// Delay before reconnecting after a gateway failure.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Gateway intent bits: C2C and group at-message events.
const GATEWAY_INTENTS: u64 = 1 << 25;

/// QQ official bot connector.
pub struct QqChannel {
    api: Arc<QqApiClient>,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
    status: Arc<RwLock<ChannelStatus>>,
    /// Last inbound message id per openid, used for passive replies.
    last_inbound: Mutex<HashMap<String, String>>,
    /// Reply sequence per inbound message id.
    msg_seq: Mutex<HashMap<String, u32>>,
    last_gateway_seq: AtomicI64,
}

impl QqChannel {
    /// Create a channel for the given bot credentials.
    pub fn new(app_id: &str, client_secret: &str, allow_from: Vec<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            api: Arc::new(QqApiClient::new(app_id, client_secret)),
            bus,
            allow_from,
            status: Arc::new(RwLock::new(ChannelStatus::Stopped)),
            last_inbound: Mutex::new(HashMap::new()),
            msg_seq: Mutex::new(HashMap::new()),
            last_gateway_seq: AtomicI64::new(0),
        }
    }

    async fn set_status(&self, status: ChannelStatus) {
        *self.status.write().await = status;
    }

    async fn next_seq(&self, msg_id: &str) -> u32 {
        let mut seqs = self.msg_seq.lock().await;
        let seq = seqs.entry(msg_id.to_owned()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Handle one `op: 0` dispatch frame.
    async fn handle_dispatch(&self, event_type: &str, data: &Value) {
        if event_type != "C2C_MESSAGE_CREATE" {
            debug!(event_type, "skipping unhandled dispatch");
            return;
        }

        let openid = data
            .pointer("/author/user_openid")
            .and_then(|o| o.as_str())
            .unwrap_or("")
            .to_owned();
        let content = data
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
        let message_id = data
            .get("id")
            .and_then(|i| i.as_str())
            .unwrap_or("")
            .to_owned();

        if openid.is_empty() || content.is_empty() {
            return;
        }

        // Passive replies must quote a recent inbound message id.
        self.last_inbound
            .lock()
            .await
            .insert(openid.clone(), message_id.clone());

        let mut metadata = HashMap::new();
        metadata.insert("message_id".into(), json!(message_id));
        metadata.insert("is_group".into(), json!(false));

        deliver_inbound(
            &self.bus,
            "qq",
            &self.allow_from,
            &openid,
            &openid,
            &content,
            vec![],
            metadata,
        );
    }

    /// One gateway session: identify, heartbeat, dispatch until it drops.
    async fn run_gateway_session(&self, cancel: &CancellationToken) -> Result<(), ChannelError> {
        let gateway_url = self.api.gateway_url().await?;
        let (stream, _) = tokio_tungstenite::connect_async(&gateway_url)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        info!("QQ gateway connected");

        let (mut write, mut read) = stream.split();
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(40));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let seq = self.last_gateway_seq.load(Ordering::SeqCst);
                    let beat = json!({"op": 1, "d": if seq > 0 { json!(seq) } else { Value::Null }});
                    if write.send(WsMessage::Text(beat.to_string().into())).await.is_err() {
                        return Err(ChannelError::ConnectionFailed("heartbeat send failed".into()));
                    }
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Err(ChannelError::ConnectionFailed("gateway stream ended".into()));
                    };
                    let text = match frame {
                        Ok(WsMessage::Text(text)) => text,
                        Ok(WsMessage::Close(_)) => {
                            return Err(ChannelError::ConnectionFailed("gateway closed".into()));
                        }
                        Ok(WsMessage::Ping(data)) => {
                            let _ = write.send(WsMessage::Pong(data)).await;
                            continue;
                        }
                        Ok(_) => continue,
                        Err(e) => return Err(ChannelError::ReceiveFailed(e.to_string())),
                    };

                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        debug!("non-JSON gateway frame, skipping");
                        continue;
                    };

                    if let Some(seq) = frame.get("s").and_then(|s| s.as_i64()) {
                        self.last_gateway_seq.store(seq, Ordering::SeqCst);
                    }

                    match frame.get("op").and_then(|o| o.as_i64()).unwrap_or(-1) {
                        // Hello: reset the heartbeat cadence and identify.
                        10 => {
                            let interval_ms = frame
                                .pointer("/d/heartbeat_interval")
                                .and_then(|i| i.as_u64())
                                .unwrap_or(40_000);
                            heartbeat = tokio::time::interval(
                                std::time::Duration::from_millis(interval_ms),
                            );
                            heartbeat.tick().await;

                            let token = self.api.access_token().await?;
                            let identify = json!({
                                "op": 2,
                                "d": {
                                    "token": format!("QQBot {token}"),
                                    "intents": GATEWAY_INTENTS,
                                    "shard": [0, 1],
                                },
                            });
                            write
                                .send(WsMessage::Text(identify.to_string().into()))
                                .await
                                .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
                            debug!("QQ gateway identified");
                        }
                        0 => {
                            let event_type = frame
                                .get("t")
                                .and_then(|t| t.as_str())
                                .unwrap_or("")
                                .to_owned();
                            if event_type == "READY" {
                                info!("QQ gateway session ready");
                                continue;
                            }
                            let data = frame.get("d").cloned().unwrap_or_default();
                            self.handle_dispatch(&event_type, &data).await;
                        }
                        11 => debug!("heartbeat acknowledged"),
                        7 | 9 => {
                            // Reconnect / invalid session: drop and redial.
                            return Err(ChannelError::ConnectionFailed(
                                "gateway requested reconnect".into(),
                            ));
                        }
                        other => debug!(op = other, "unhandled gateway opcode"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Channel for QqChannel {
    fn name(&self) -> &str {
        "qq"
    }

    fn status(&self) -> ChannelStatus {
        self.status
            .try_read()
            .map(|s| s.clone())
            .unwrap_or(ChannelStatus::Stopped)
    }

    fn supports_streaming(&self) -> bool {
        // Line-buffered: flushes arrive as independent outbound messages.
        true
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        crate::traits::allow_from_matches(&self.allow_from, sender_id)
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        self.set_status(ChannelStatus::Starting).await;

        loop {
            self.set_status(ChannelStatus::Running).await;
            match self.run_gateway_session(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "QQ gateway session failed");
                    self.set_status(ChannelStatus::Error(e.to_string())).await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(
                    std::time::Duration::from_secs(RECONNECT_DELAY_SECS)
                ) => info!("reconnecting QQ gateway"),
            }
        }

        self.set_status(ChannelStatus::Stopped).await;
        info!("QQ channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
        // Line-buffered channels never receive edit-style frames, but
        // drop them defensively if the config routes them here.
        if msg.is_streaming() || msg.is_streaming_end() || msg.is_progress() {
            return Ok(MessageId(String::new()));
        }
        if msg.content.trim().is_empty() {
            return Ok(MessageId(String::new()));
        }

        let reply_id = match &msg.reply_to {
            Some(id) => Some(id.clone()),
            None => self.last_inbound.lock().await.get(&msg.chat_id).cloned(),
        };

        for chunk in chunk_text(&msg.content, MAX_MESSAGE_CHARS) {
            let seq = match &reply_id {
                Some(id) => self.next_seq(id).await,
                None => 1,
            };
            retry_send("qq send", || {
                self.api
                    .send_c2c_message(&msg.chat_id, &chunk, reply_id.as_deref(), seq)
            })
            .await?;
        }

        if !msg.media.is_empty() {
            warn!(count = msg.media.len(), "qq media delivery not supported, dropping attachments");
        }

        Ok(MessageId(String::new()))
    }
}

/// Factory for [`QqChannel`].
pub struct QqChannelFactory;

impl ChannelFactory for QqChannelFactory {
    fn channel_name(&self) -> &str {
        "qq"
    }

    fn build(
        &self,
        config: &ChannelSection,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let app_id = config
            .str_field("app_id")
            .ok_or_else(|| ChannelError::Other("missing 'app_id' in qq config".into()))?;
        let secret = config
            .str_field("client_secret")
            .ok_or_else(|| ChannelError::Other("missing 'client_secret' in qq config".into()))?;

        Ok(Arc::new(QqChannel::new(
            app_id,
            secret,
            config.allow_from.clone(),
            bus,
        )))
    }
}
