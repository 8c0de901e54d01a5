//! Wire types for the subset of the Telegram Bot API the connector uses.

use serde::{Deserialize, Serialize};

/// Generic Bot API response envelope.
#[derive(Debug, Deserialize)]
pub struct TelegramResponse<T> {
    /// Whether the call succeeded.
    pub ok: bool,
    /// The payload on success.
    pub result: Option<T>,
    /// Error description on failure.
    pub description: Option<String>,
}

/// One long-poll update.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    /// Monotonic update id; the next poll offset is `update_id + 1`.
    pub update_id: i64,
    /// The contained message, when this update carries one.
    pub message: Option<Message>,
}

/// An incoming or sent message.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

/// A Telegram user.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
}

/// A chat (private, group, supergroup, channel).
#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

/// `sendMessage` request body.
#[derive(Debug, Serialize)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
}

/// `editMessageText` request body.
#[derive(Debug, Serialize)]
pub struct EditMessageTextRequest {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
}
