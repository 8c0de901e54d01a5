//! Telegram connector.
//!
//! Long-polls the Bot API for updates and answers with `sendMessage`.
//! Streamed turns use the edit-last-message pattern: the first snapshot
//! creates a message and later snapshots edit it in place via
//! `editMessageText` until the terminator arrives.

mod channel;
mod client;
mod types;

pub use channel::{TelegramChannel, TelegramChannelFactory};
pub use client::TelegramClient;
