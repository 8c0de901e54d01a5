//! Feishu / Lark connector -- the canonical card-edit streaming channel.
//!
//! Inbound messages arrive over the open-platform long-connection
//! WebSocket; outbound replies render as interactive cards. During a
//! streamed turn the connector owns a single platform-side card and
//! pushes the cumulative text into it via the card streaming-update API,
//! finalizing the card when the turn ends.

mod api;
mod card;
mod channel;
mod markdown;

pub use api::FeishuClient;
pub use card::{CardState, CardStreamManager};
pub use channel::{FeishuChannel, FeishuChannelFactory};
pub use markdown::build_card_elements;
