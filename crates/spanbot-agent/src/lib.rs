//! Agent transports and adapter for the spanbot gateway.
//!
//! Talks to the external `iflow` agent process over one of three
//! interchangeable transports — spawned-child stdio JSON-RPC, JSON-RPC
//! over WebSocket, or a one-shot CLI invocation — behind the uniform
//! [`AgentTransport`](transport::AgentTransport) contract. The
//! [`AgentAdapter`](adapter::AgentAdapter) layers per-conversation session
//! binding, invalidation recovery with history replay, and streaming
//! forwarding on top, and implements the `AgentBackend` seam consumed by
//! the agent loop in `spanbot-core`.

pub mod adapter;
pub mod history;
pub mod rpc;
pub mod session;
pub mod transport;

pub use adapter::AgentAdapter;
pub use session::SessionStore;
pub use transport::{AgentTransport, PromptOutcome, SessionOptions, StopReason, ToolCall};
