//! Seam traits between the agent loop and its collaborators.
//!
//! [`AgentBackend`] is the loop's view of the agent adapter: a uniform
//! chat / streaming-chat / session-reset contract, regardless of which
//! transport (stdio, WebSocket, one-shot CLI) carries the conversation.
//!
//! [`CardStream`] is implemented by connectors on platforms that render a
//! streamed reply by repeatedly editing a single platform-side card; the
//! loop calls it directly instead of going through the outbound queue.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use spanbot_types::error::AgentError;

/// One streamed fragment of agent output.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// The fragment text (a delta, not cumulative).
    pub text: String,
    /// Whether this fragment belongs to the agent's thought stream.
    pub is_thought: bool,
}

/// Async callback receiving [`StreamChunk`]s during a streamed turn.
pub type ChunkHandler = Arc<dyn Fn(StreamChunk) -> BoxFuture<'static, ()> + Send + Sync>;

/// The agent adapter as seen by the loop.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Send a message and await the full response.
    async fn chat(&self, message: &str, channel: &str, chat_id: &str)
    -> Result<String, AgentError>;

    /// Send a message, forwarding chunks to `on_chunk` as they arrive.
    ///
    /// All chunks (including thoughts) are forwarded; the returned string
    /// is the concatenation of the non-thought content.
    async fn chat_stream(
        &self,
        message: &str,
        channel: &str,
        chat_id: &str,
        on_chunk: ChunkHandler,
    ) -> Result<String, AgentError>;

    /// Drop the session binding for a conversation. Returns whether a
    /// binding existed. The next chat lazily creates a fresh session.
    async fn clear_session(&self, channel: &str, chat_id: &str) -> bool;
}

/// A connector that streams by editing a single platform-side card.
#[async_trait]
pub trait CardStream: Send + Sync {
    /// Create the card instance for a new streamed turn.
    async fn start_streaming(&self, chat_id: &str);

    /// Push the cumulative text so far; `is_final` closes the card.
    ///
    /// The connector decides internally whether an API call is warranted
    /// for a given snapshot.
    async fn handle_streaming_chunk(&self, chat_id: &str, text: &str, is_final: bool);
}
