//! DingTalk connector.
//!
//! Receives messages over stream mode (an outbound WebSocket, no public
//! IP required) and replies through the robot batch-send HTTP API with
//! markdown payloads.

mod channel;

pub use channel::{DingTalkChannel, DingTalkChannelFactory};
