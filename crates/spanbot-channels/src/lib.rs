//! Platform connectors for the spanbot gateway.
//!
//! Each connector implements the [`Channel`](traits::Channel) trait:
//! long-lived inbound ingestion publishing to the shared message bus, and
//! outbound `send` with platform-specific rendering. The
//! [`ChannelManager`](manager::ChannelManager) owns connector lifecycle
//! and runs the outbound dispatcher; connectors are created through the
//! compile-time factory table in [`builtin_factories`].
//!
//! Feishu is the canonical card-edit streaming connector: it additionally
//! implements `spanbot_core::CardStream` so the agent loop can edit one
//! platform-side card in place while a reply streams.

pub mod dingtalk;
pub mod feishu;
pub mod manager;
pub mod qq;
pub mod slack;
pub mod telegram;
pub mod traits;
pub mod util;

use std::sync::Arc;

pub use manager::ChannelManager;
pub use traits::{Channel, ChannelFactory, ChannelStatus, MessageId};

/// The compile-time name → constructor table for built-in connectors.
pub fn builtin_factories() -> Vec<Arc<dyn ChannelFactory>> {
    vec![
        Arc::new(feishu::FeishuChannelFactory),
        Arc::new(telegram::TelegramChannelFactory),
        Arc::new(qq::QqChannelFactory),
        Arc::new(dingtalk::DingTalkChannelFactory),
        Arc::new(slack::SlackChannelFactory),
    ]
}
