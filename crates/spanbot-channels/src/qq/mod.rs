//! QQ official bot connector.
//!
//! Receives C2C messages over the bot gateway WebSocket (hello /
//! identify / heartbeat / dispatch opcodes) and sends through the
//! OpenAPI. QQ enforces strict per-message limits, so streamed turns are
//! line-buffered upstream: every flush arrives here as an independent
//! outbound message answered as a passive reply with an increasing
//! `msg_seq`.

mod api;
mod channel;

pub use api::QqApiClient;
pub use channel::{QqChannel, QqChannelFactory};
