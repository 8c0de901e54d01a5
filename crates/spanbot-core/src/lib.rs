//! Core engine for the spanbot chat gateway.
//!
//! Provides the [`MessageBus`](bus::MessageBus) decoupling connectors from
//! the agent, the [`AgentLoop`](agent_loop::AgentLoop) that drives turns
//! with per-user serialization and streaming fan-out, the
//! [`ResultAnalyzer`](analyzer::ResultAnalyzer) that scans agent output for
//! artifacts, and the stream buffer machinery behind channel-aware
//! chunk flushing.
//!
//! The agent itself is reached through the [`AgentBackend`](backend::AgentBackend)
//! seam trait, implemented by `spanbot-agent`; card-edit connectors plug in
//! through [`CardStream`](backend::CardStream).

pub mod agent_loop;
pub mod analyzer;
pub mod backend;
pub mod bus;
pub mod context;
pub mod recorder;
pub mod stream;

pub use agent_loop::AgentLoop;
pub use backend::{AgentBackend, CardStream, ChunkHandler, StreamChunk};
pub use bus::MessageBus;
