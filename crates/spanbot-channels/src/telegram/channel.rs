//! [`TelegramChannel`] -- `Channel` trait implementation for Telegram.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_core::MessageBus;
use spanbot_types::config::ChannelSection;
use spanbot_types::error::ChannelError;
use spanbot_types::event::OutboundMessage;

use crate::traits::{Channel, ChannelFactory, ChannelStatus, MessageId, deliver_inbound};
use crate::util::{chunk_text, retry_send};

use super::client::TelegramClient;

/// Telegram's per-message character limit.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Long-poll timeout in seconds for `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Delay before retrying after a poll error.
const ERROR_RETRY_DELAY_SECS: u64 = 5;

/// State of the in-place-edited message for one streamed turn.
struct EditState {
    message_id: i64,
    last_content: String,
}

/// Telegram Bot connector using long polling.
pub struct TelegramChannel {
    client: TelegramClient,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
    status: Arc<RwLock<ChannelStatus>>,
    offset: AtomicI64,
    /// Per-chat edit-last state for streamed turns.
    edits: Mutex<HashMap<String, EditState>>,
}

impl TelegramChannel {
    /// Create a channel with the given bot token and allow-list.
    pub fn new(token: &str, allow_from: Vec<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            client: TelegramClient::new(token),
            bus,
            allow_from,
            status: Arc::new(RwLock::new(ChannelStatus::Stopped)),
            offset: AtomicI64::new(0),
            edits: Mutex::new(HashMap::new()),
        }
    }

    async fn set_status(&self, status: ChannelStatus) {
        *self.status.write().await = status;
    }

    async fn process_update(&self, update: &super::types::Update) {
        let Some(msg) = &update.message else {
            debug!(update_id = update.update_id, "skipping non-message update");
            return;
        };
        let Some(text) = &msg.text else {
            debug!(update_id = update.update_id, "skipping message without text");
            return;
        };

        let sender_id = msg
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();
        let chat_id = msg.chat.id.to_string();

        let mut metadata = HashMap::new();
        metadata.insert(
            "message_id".into(),
            serde_json::Value::Number(msg.message_id.into()),
        );
        metadata.insert(
            "is_group".into(),
            serde_json::Value::Bool(msg.chat.chat_type != "private"),
        );
        if let Some(from) = &msg.from {
            metadata.insert("first_name".into(), from.first_name.clone().into());
            if let Some(username) = &from.username {
                metadata.insert("username".into(), username.clone().into());
            }
        }

        deliver_inbound(
            &self.bus,
            "telegram",
            &self.allow_from,
            &sender_id,
            &chat_id,
            text,
            vec![],
            metadata,
        );
    }

    /// Handle a mid-stream snapshot: edit the last message in place, or
    /// create it on the first flush.
    async fn handle_streaming_snapshot(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let content = msg.content.trim();
        if content.is_empty() {
            return Ok(());
        }

        let chat_id: i64 = parse_chat_id(&msg.chat_id)?;
        let mut edits = self.edits.lock().await;

        if let Some(state) = edits.get_mut(&msg.chat_id) {
            if state.last_content == content {
                return Ok(());
            }
            match self
                .client
                .edit_message_text(chat_id, state.message_id, content)
                .await
            {
                Ok(()) => {
                    state.last_content = content.to_owned();
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "edit failed, recreating streamed message");
                    edits.remove(&msg.chat_id);
                }
            }
        }

        let sent = self.client.send_message(chat_id, content, None).await?;
        edits.insert(
            msg.chat_id.clone(),
            EditState {
                message_id: sent.message_id,
                last_content: content.to_owned(),
            },
        );
        Ok(())
    }

    async fn send_plain(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
        let chat_id = parse_chat_id(&msg.chat_id)?;
        let reply_to = msg.reply_to.as_deref().and_then(|id| id.parse::<i64>().ok());

        for path in &msg.media {
            if let Err(e) = retry_send("sendDocument", || self.client.send_document(chat_id, path))
                .await
            {
                error!(path = %path, error = %e, "failed to send attachment");
            }
        }

        let mut last_id = String::new();
        for (index, chunk) in chunk_text(&msg.content, MAX_MESSAGE_CHARS).iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            // Only the first chunk replies to the source message.
            let reply = if index == 0 { reply_to } else { None };
            let sent = retry_send("sendMessage", || {
                self.client.send_message(chat_id, chunk, reply)
            })
            .await?;
            last_id = sent.message_id.to_string();
        }
        Ok(MessageId(last_id))
    }
}

fn parse_chat_id(chat_id: &str) -> Result<i64, ChannelError> {
    chat_id.parse().map_err(|_| {
        ChannelError::SendFailed(format!("invalid chat_id '{chat_id}': expected i64"))
    })
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
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

    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        self.set_status(ChannelStatus::Starting).await;

        let me = self.client.get_me().await.inspect_err(|e| {
            error!(error = %e, "failed to verify Telegram bot token");
        })?;
        info!(bot_id = me.id, bot_name = %me.first_name, "Telegram bot authenticated");

        self.set_status(ChannelStatus::Running).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Telegram channel received cancellation");
                    break;
                }
                result = self.client.get_updates(
                    Some(self.offset.load(Ordering::SeqCst)),
                    POLL_TIMEOUT_SECS,
                ) => {
                    match result {
                        Ok(updates) => {
                            for update in &updates {
                                self.process_update(update).await;
                                // Advance past this update regardless of outcome.
                                self.offset.store(update.update_id + 1, Ordering::SeqCst);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "getUpdates failed");
                            self.set_status(ChannelStatus::Error(e.to_string())).await;

                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(
                                    std::time::Duration::from_secs(ERROR_RETRY_DELAY_SECS)
                                ) => {}
                            }
                            self.set_status(ChannelStatus::Running).await;
                        }
                    }
                }
            }
        }

        self.set_status(ChannelStatus::Stopped).await;
        info!("Telegram channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
        if msg.is_streaming_end() {
            self.edits.lock().await.remove(&msg.chat_id);
            return Ok(MessageId(String::new()));
        }
        if msg.is_streaming() {
            self.handle_streaming_snapshot(msg).await?;
            // Attachments discovered at stream end arrive on the final snapshot.
            if !msg.media.is_empty() {
                let chat_id = parse_chat_id(&msg.chat_id)?;
                for path in &msg.media {
                    if let Err(e) =
                        retry_send("sendDocument", || self.client.send_document(chat_id, path))
                            .await
                    {
                        error!(path = %path, error = %e, "failed to send attachment");
                    }
                }
            }
            return Ok(MessageId(String::new()));
        }
        if msg.is_progress() {
            // Advisory only; Telegram does not render progress frames.
            return Ok(MessageId(String::new()));
        }

        self.edits.lock().await.remove(&msg.chat_id);
        self.send_plain(msg).await
    }
}

/// Factory for [`TelegramChannel`].
pub struct TelegramChannelFactory;

impl ChannelFactory for TelegramChannelFactory {
    fn channel_name(&self) -> &str {
        "telegram"
    }

    fn build(
        &self,
        config: &ChannelSection,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let token = config
            .str_field("token")
            .ok_or_else(|| ChannelError::Other("missing 'token' in telegram config".into()))?;

        Ok(Arc::new(TelegramChannel::new(
            token,
            config.allow_from.clone(),
            bus,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(token: Option<&str>) -> ChannelSection {
        let mut section = ChannelSection {
            enabled: true,
            allow_from: vec!["42".into()],
            ..Default::default()
        };
        if let Some(token) = token {
            section
                .extra
                .insert("token".into(), serde_json::json!(token));
        }
        section
    }

    #[test]
    fn factory_requires_token() {
        let bus = Arc::new(MessageBus::new());
        assert!(TelegramChannelFactory.build(&section(None), bus.clone()).is_err());
        let channel = TelegramChannelFactory.build(&section(Some("t:1")), bus).unwrap();
        assert_eq!(channel.name(), "telegram");
        assert!(channel.supports_streaming());
    }

    #[test]
    fn allow_list_applies() {
        let bus = Arc::new(MessageBus::new());
        let channel = TelegramChannel::new("t", vec!["42".into()], bus);
        assert!(channel.is_allowed("42"));
        assert!(!channel.is_allowed("43"));
    }

    #[test]
    fn chat_id_must_be_numeric() {
        assert!(parse_chat_id("12345").is_ok());
        assert!(parse_chat_id("oc_abc").is_err());
    }

    #[tokio::test]
    async fn progress_frames_are_dropped() {
        let bus = Arc::new(MessageBus::new());
        let channel = TelegramChannel::new("t", vec![], bus);

        let msg = OutboundMessage::new("telegram", "42", "working...")
            .with_flag(spanbot_types::event::META_PROGRESS);
        let id = channel.send(&msg).await.unwrap();
        assert!(id.0.is_empty());
    }

    #[tokio::test]
    async fn terminator_clears_edit_state() {
        let bus = Arc::new(MessageBus::new());
        let channel = TelegramChannel::new("t", vec![], bus);

        channel.edits.lock().await.insert(
            "42".into(),
            EditState {
                message_id: 7,
                last_content: "partial".into(),
            },
        );

        let msg = OutboundMessage::new("telegram", "42", "")
            .with_flag(spanbot_types::event::META_STREAMING_END);
        channel.send(&msg).await.unwrap();
        assert!(channel.edits.lock().await.is_empty());
    }
}
