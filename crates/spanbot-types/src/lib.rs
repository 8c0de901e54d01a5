//! Core types for the spanbot chat gateway.
//!
//! This crate has no async runtime dependency; it defines the message
//! events exchanged over the bus, the configuration schema, the cron job
//! data model, and the shared error types used by every other crate in
//! the workspace.

pub mod config;
pub mod cron;
pub mod error;
pub mod event;

pub use error::{AgentError, ChannelError, SpanbotError};
pub use event::{InboundMessage, OutboundMessage};
