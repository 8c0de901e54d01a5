//! The agent loop: single consumer of the inbound queue.
//!
//! Each inbound message gets a short-lived worker task that first takes
//! the per-conversation mutex, so at most one turn is in flight per
//! `(channel, chat_id)` at any time. The worker assembles the prompt
//! (message source block plus bootstrap / workspace-guide injection),
//! drives the agent through the [`AgentBackend`] seam, fans streamed
//! chunks out according to the channel's [`StreamFamily`], scans the final
//! text for artifacts, and publishes the outbound reply.
//!
//! The scheduler and heartbeat services inject synthetic turns through
//! [`process_direct`](AgentLoop::process_direct), bypassing the inbound
//! queue.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use spanbot_types::error::AgentError;
use spanbot_types::event::{
    InboundMessage, META_PROGRESS, META_STREAMING, META_STREAMING_END, OutboundMessage,
};

use crate::analyzer::ResultAnalyzer;
use crate::backend::{AgentBackend, CardStream, ChunkHandler, StreamChunk};
use crate::bus::MessageBus;
use crate::context::assemble_prompt;
use crate::stream::{StreamBuffer, StreamFamily};

/// Acknowledgement published when a `/new` or `/start` command clears the
/// session binding.
pub const NEW_CHAT_ACK: &str = "✨ Started a new conversation; previous context cleared.";

/// Loop behavior knobs.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Agent workspace (location of BOOTSTRAP.md / AGENTS.md).
    pub workspace: PathBuf,
    /// Whether streaming fan-out is enabled at all.
    pub streaming: bool,
    /// Channels that may receive streamed output.
    pub streaming_channels: HashSet<String>,
    /// Channels flushed line-by-line instead of by message edits.
    pub line_buffered_channels: HashSet<String>,
    /// Newline count per line-buffered flush (0 = single final flush).
    pub line_split_threshold: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            streaming: true,
            streaming_channels: HashSet::new(),
            line_buffered_channels: ["qq", "dingtalk"].iter().map(|s| s.to_string()).collect(),
            line_split_threshold: 5,
        }
    }
}

/// Consumes inbound messages and drives agent turns.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    backend: Arc<dyn AgentBackend>,
    config: LoopConfig,
    analyzer: ResultAnalyzer,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    card_streams: RwLock<HashMap<String, Arc<dyn CardStream>>>,
}

impl AgentLoop {
    /// Create a loop over the given bus and backend.
    pub fn new(bus: Arc<MessageBus>, backend: Arc<dyn AgentBackend>, config: LoopConfig) -> Self {
        Self {
            bus,
            backend,
            config,
            analyzer: ResultAnalyzer::new(),
            user_locks: Mutex::new(HashMap::new()),
            card_streams: RwLock::new(HashMap::new()),
        }
    }

    /// Register a card-edit connector for direct streaming calls.
    pub async fn register_card_stream(&self, channel: &str, card: Arc<dyn CardStream>) {
        info!(channel, "registered card-edit stream");
        self.card_streams.write().await.insert(channel.to_owned(), card);
    }

    /// Run until the token is cancelled or the bus stops.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("agent loop started, listening for inbound messages");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("agent loop shutting down");
                    break;
                }
                msg = self.bus.consume_inbound() => {
                    let Some(msg) = msg else {
                        info!("inbound queue closed, agent loop exiting");
                        break;
                    };
                    let this = self.clone();
                    tokio::spawn(async move { this.process_message(msg).await });
                }
            }
        }
    }

    /// Lock handle for one conversation; entries are never evicted.
    async fn user_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one inbound message under the per-conversation lock.
    pub async fn process_message(&self, msg: InboundMessage) {
        let key = msg.session_key();
        let lock = self.user_lock(&key).await;
        let _guard = lock.lock().await;

        debug!(key = %key, "processing inbound message");

        if let Err(e) = self.handle_turn(&msg).await {
            error!(key = %key, error = %e, "turn failed");
            self.bus.publish_outbound(OutboundMessage::new(
                msg.channel.clone(),
                msg.chat_id.clone(),
                format!("❌ Error processing message: {e}"),
            ));
        }
    }

    async fn handle_turn(&self, msg: &InboundMessage) -> Result<(), AgentError> {
        let command = msg.content.trim().to_ascii_lowercase();
        if command == "/new" || command == "/start" {
            self.backend.clear_session(&msg.channel, &msg.chat_id).await;
            self.bus.publish_outbound(OutboundMessage::new(
                msg.channel.clone(),
                msg.chat_id.clone(),
                NEW_CHAT_ACK,
            ));
            return Ok(());
        }

        let prompt = assemble_prompt(
            &self.config.workspace,
            &msg.channel,
            &msg.chat_id,
            &msg.content,
        );

        if self.config.streaming && self.config.streaming_channels.contains(&msg.channel) {
            self.handle_streaming_turn(msg, &prompt).await
        } else {
            self.handle_plain_turn(msg, &prompt).await
        }
    }

    async fn handle_plain_turn(
        &self,
        msg: &InboundMessage,
        prompt: &str,
    ) -> Result<(), AgentError> {
        let response = self
            .backend
            .chat(prompt, &msg.channel, &msg.chat_id)
            .await?;

        if response.is_empty() {
            debug!(channel = %msg.channel, chat_id = %msg.chat_id, "empty response, nothing to send");
            return Ok(());
        }

        let analysis = self.analyzer.analyze(&response);
        let mut out = OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), response);
        out.reply_to = reply_target(msg);
        out.media = analysis.all_files;
        self.bus.publish_outbound(out);
        Ok(())
    }

    fn family_for(&self, channel: &str, has_card: bool) -> StreamFamily {
        if has_card {
            StreamFamily::CardEdit
        } else if self.config.line_buffered_channels.contains(channel) {
            StreamFamily::LineBuffered
        } else {
            StreamFamily::EditLast
        }
    }

    async fn handle_streaming_turn(
        &self,
        msg: &InboundMessage,
        prompt: &str,
    ) -> Result<(), AgentError> {
        let card = self.card_streams.read().await.get(&msg.channel).cloned();
        let family = self.family_for(&msg.channel, card.is_some());
        let reply_to = reply_target(msg);

        let buffer = Arc::new(Mutex::new(StreamBuffer::new(
            self.config.line_split_threshold,
        )));

        if let Some(card) = &card {
            card.start_streaming(&msg.chat_id).await;
        }

        let on_chunk = self.make_chunk_handler(msg, family, card.clone(), buffer.clone());
        let response = self
            .backend
            .chat_stream(prompt, &msg.channel, &msg.chat_id, on_chunk)
            .await?;

        let analysis = self.analyzer.analyze(&response);
        let media = analysis.all_files;

        match family {
            StreamFamily::CardEdit => {
                if let Some(card) = &card {
                    card.handle_streaming_chunk(&msg.chat_id, &response, true).await;
                }
                if !media.is_empty() {
                    let mut out = OutboundMessage::new(
                        msg.channel.clone(),
                        msg.chat_id.clone(),
                        String::new(),
                    );
                    out.reply_to = reply_to;
                    out.media = media;
                    self.bus.publish_outbound(out);
                }
            }
            StreamFamily::LineBuffered => {
                let tail = buffer.lock().await.finish_lines();
                let content = tail.unwrap_or_default();
                if !content.is_empty() || !media.is_empty() {
                    let mut out =
                        OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), content);
                    out.reply_to = reply_to;
                    out.media = media;
                    self.bus.publish_outbound(out);
                }
            }
            StreamFamily::EditLast => {
                let full = buffer.lock().await.accumulated().to_owned();
                let mut snapshot =
                    OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), full)
                        .with_flag(META_STREAMING)
                        .with_flag(META_PROGRESS);
                snapshot.reply_to = reply_to.clone();
                snapshot.media = media;
                self.bus.publish_outbound(snapshot);

                let mut terminator =
                    OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), String::new())
                        .with_flag(META_STREAMING_END);
                terminator.reply_to = reply_to;
                self.bus.publish_outbound(terminator);
            }
        }

        Ok(())
    }

    fn make_chunk_handler(
        &self,
        msg: &InboundMessage,
        family: StreamFamily,
        card: Option<Arc<dyn CardStream>>,
        buffer: Arc<Mutex<StreamBuffer>>,
    ) -> ChunkHandler {
        let bus = self.bus.clone();
        let channel = msg.channel.clone();
        let chat_id = msg.chat_id.clone();
        let reply_to = reply_target(msg);

        Arc::new(move |chunk: StreamChunk| {
            let bus = bus.clone();
            let channel = channel.clone();
            let chat_id = chat_id.clone();
            let reply_to = reply_to.clone();
            let card = card.clone();
            let buffer = buffer.clone();

            Box::pin(async move {
                if chunk.is_thought || chunk.text.is_empty() {
                    return;
                }

                match family {
                    StreamFamily::CardEdit => {
                        let accumulated = {
                            let mut buf = buffer.lock().await;
                            buf.push(&chunk.text);
                            buf.accumulated().to_owned()
                        };
                        if let Some(card) = &card {
                            card.handle_streaming_chunk(&chat_id, &accumulated, false).await;
                        }
                    }
                    StreamFamily::LineBuffered => {
                        let segments = buffer.lock().await.push_lines(&chunk.text);
                        for segment in segments {
                            let mut out =
                                OutboundMessage::new(channel.clone(), chat_id.clone(), segment);
                            out.reply_to = reply_to.clone();
                            bus.publish_outbound(out);
                        }
                    }
                    StreamFamily::EditLast => {
                        let snapshot = buffer.lock().await.push_edit_last(&chunk.text);
                        if let Some(content) = snapshot {
                            let mut out =
                                OutboundMessage::new(channel.clone(), chat_id.clone(), content)
                                    .with_flag(META_STREAMING)
                                    .with_flag(META_PROGRESS);
                            out.reply_to = reply_to.clone();
                            bus.publish_outbound(out);
                        }
                    }
                }
            })
        })
    }

    /// Process a synthetic turn from the scheduler or heartbeat.
    ///
    /// `session_key` values like `cron:{id}` split on the first `:` into a
    /// synthetic `(channel, chat_id)` pair for session binding; a bare key
    /// is used for both halves. No streaming is performed.
    pub async fn process_direct(
        &self,
        message: &str,
        session_key: Option<&str>,
    ) -> Result<String, AgentError> {
        let (channel, chat_id) = match session_key {
            Some(key) => match key.split_once(':') {
                Some((channel, chat_id)) => (channel.to_owned(), chat_id.to_owned()),
                None => (key.to_owned(), key.to_owned()),
            },
            None => ("cli".to_owned(), "direct".to_owned()),
        };

        let lock = self.user_lock(&format!("{channel}:{chat_id}")).await;
        let _guard = lock.lock().await;

        let prompt = assemble_prompt(&self.config.workspace, &channel, &chat_id, message);
        self.backend.chat(&prompt, &channel, &chat_id).await
    }
}

fn reply_target(msg: &InboundMessage) -> Option<String> {
    msg.metadata.get("message_id").map(|v| match v.as_str() {
        Some(s) => s.to_owned(),
        None => v.to_string(),
    })
}
