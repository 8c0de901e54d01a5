//! The agent adapter: uniform `chat` / `chat_stream` / `new_chat` on top
//! of a transport and the session store.
//!
//! Session resolution is the critical path: an existing binding is used
//! directly; otherwise a session is created under a double-checked mutex
//! so concurrent first turns for the same conversation share one session.
//! When the agent rejects a bound id with an "Invalid request"-class
//! error, the adapter rotates the binding, replays recent history
//! extracted from the old session's transcript, and retries exactly once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use spanbot_core::backend::{AgentBackend, ChunkHandler, StreamChunk};
use spanbot_types::error::AgentError;

use crate::history::extract_history;
use crate::session::SessionStore;
use crate::transport::{
    AgentTransport, PromptOutcome, SessionOptions, SessionUpdate, UpdateHandler,
};

/// Marker separating injected context from the verbatim user text.
const USER_MESSAGE_MARKER: &str = "用户消息:";

/// Adapter settings.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Agent workspace directory (sessions are created with this cwd).
    pub workspace: PathBuf,
    /// Model id for new sessions.
    pub model: String,
    /// Per-turn timeout.
    pub timeout: Duration,
    /// Return the thought stream alongside the response in `chat`.
    pub thinking: bool,
    /// Directory holding the agent's persisted session transcripts.
    pub sessions_dir: PathBuf,
}

/// Uniform chat surface over a transport plus the session map.
pub struct AgentAdapter {
    transport: Arc<dyn AgentTransport>,
    sessions: Arc<SessionStore>,
    config: AdapterConfig,
    create_lock: Mutex<()>,
}

impl AgentAdapter {
    /// Build an adapter over the given transport and session store.
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        sessions: Arc<SessionStore>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            transport,
            sessions,
            config,
            create_lock: Mutex::new(()),
        }
    }

    /// Start the transport, negotiate capabilities, and authenticate.
    pub async fn connect(&self) -> Result<(), AgentError> {
        self.transport.start().await?;
        self.transport.initialize().await?;

        if !self.transport.authenticate("iflow").await? {
            warn!("agent authentication failed, some features may not work");
        }
        Ok(())
    }

    /// Stop the transport.
    pub async fn disconnect(&self) {
        self.transport.stop().await;
    }

    /// All current session bindings.
    pub fn list_sessions(&self) -> std::collections::HashMap<String, String> {
        self.sessions.list()
    }

    async fn get_or_create_session(
        &self,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        if let Some(session_id) = self.sessions.get(channel, chat_id) {
            debug!(channel, chat_id, "reusing bound session");
            return Ok(session_id);
        }
        self.create_session_binding(channel, chat_id).await
    }

    /// Create and bind a fresh session under the double-checked mutex.
    async fn create_session_binding(
        &self,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        let _guard = self.create_lock.lock().await;

        if let Some(session_id) = self.sessions.get(channel, chat_id) {
            return Ok(session_id);
        }

        let opts = SessionOptions::new(
            self.config.workspace.clone(),
            Some(self.config.model.clone()),
        );
        let session_id = self.transport.create_session(&opts).await?;

        if !session_id.is_empty() {
            self.sessions.bind(channel, chat_id, &session_id).await?;
            info!(channel, chat_id, "session bound");
        }
        Ok(session_id)
    }

    /// Rotate an invalidated binding: capture the old id, extract replay
    /// history, create a fresh session, and splice the history into the
    /// message ahead of the user text.
    async fn recover_session(
        &self,
        channel: &str,
        chat_id: &str,
        message: &str,
    ) -> Result<(String, String), AgentError> {
        warn!(channel, chat_id, "session invalid, recreating");

        let old = self.sessions.clear(channel, chat_id).await;
        let history = old
            .as_deref()
            .and_then(|id| extract_history(&self.config.sessions_dir, id));

        let session_id = self.create_session_binding(channel, chat_id).await?;

        let message = match history {
            Some(history) => {
                info!(channel, chat_id, "injecting conversation history before user message");
                splice_history(message, &history)
            }
            None => message.to_owned(),
        };
        Ok((session_id, message))
    }

    /// Rebind when the one-shot CLI transport recovered a fresh id.
    async fn rebind_recovered(&self, channel: &str, chat_id: &str, outcome: &PromptOutcome) {
        if let Some(recovered) = &outcome.session_id
            && self.sessions.get(channel, chat_id).as_deref() != Some(recovered)
        {
            if let Err(e) = self.sessions.bind(channel, chat_id, recovered).await {
                warn!(error = %e, "failed to store recovered session id");
            }
        }
    }

    fn outcome_invalid(outcome: &PromptOutcome) -> bool {
        outcome
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Invalid request"))
    }

    async fn run_prompt(
        &self,
        channel: &str,
        chat_id: &str,
        message: &str,
        on_update: Option<UpdateHandler>,
    ) -> Result<PromptOutcome, AgentError> {
        let session_id = self.get_or_create_session(channel, chat_id).await?;
        let outcome = self
            .transport
            .prompt(&session_id, message, on_update.clone(), self.config.timeout)
            .await?;

        if !Self::outcome_invalid(&outcome) {
            self.rebind_recovered(channel, chat_id, &outcome).await;
            return Ok(outcome);
        }

        // One silent retry against a fresh session with history replay.
        let (session_id, message) = self.recover_session(channel, chat_id, message).await?;
        let outcome = self
            .transport
            .prompt(&session_id, &message, on_update, self.config.timeout)
            .await?;
        self.rebind_recovered(channel, chat_id, &outcome).await;
        Ok(outcome)
    }

    /// Send a message and await the full response.
    pub async fn chat(
        &self,
        message: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        let outcome = self.run_prompt(channel, chat_id, message, None).await?;

        if let Some(error) = outcome.error {
            return Err(AgentError::Chat(error));
        }

        if self.config.thinking && !outcome.thought.is_empty() {
            return Ok(format!(
                "[Thinking]\n{}\n\n[Response]\n{}",
                outcome.thought, outcome.content
            ));
        }
        Ok(outcome.content)
    }

    /// Send a message, forwarding every chunk to `on_chunk`.
    ///
    /// Thought chunks are forwarded too (flagged) but excluded from the
    /// returned accumulation.
    pub async fn chat_stream(
        &self,
        message: &str,
        channel: &str,
        chat_id: &str,
        on_chunk: ChunkHandler,
    ) -> Result<String, AgentError> {
        let collected = Arc::new(std::sync::Mutex::new(String::new()));

        let collected_for_handler = collected.clone();
        let handler: UpdateHandler = Arc::new(move |update: SessionUpdate| {
            let collected = collected_for_handler.clone();
            let on_chunk = on_chunk.clone();
            Box::pin(async move {
                match update {
                    SessionUpdate::MessageChunk { text, is_thought } => {
                        if !is_thought {
                            collected.lock().unwrap().push_str(&text);
                        }
                        on_chunk(StreamChunk { text, is_thought }).await;
                    }
                    SessionUpdate::ToolCall(call) => {
                        debug!(tool = %call.name, status = %call.status, "tool call update");
                    }
                }
            })
        });

        let session_id = self.get_or_create_session(channel, chat_id).await?;
        let outcome = self
            .transport
            .prompt(&session_id, message, Some(handler.clone()), self.config.timeout)
            .await?;

        let outcome = if Self::outcome_invalid(&outcome) {
            let (session_id, message) = self.recover_session(channel, chat_id, message).await?;
            collected.lock().unwrap().clear();
            self.transport
                .prompt(&session_id, &message, Some(handler), self.config.timeout)
                .await?
        } else {
            outcome
        };

        if let Some(error) = outcome.error {
            return Err(AgentError::Chat(error));
        }

        let collected = collected.lock().unwrap().clone();
        Ok(if collected.is_empty() {
            outcome.content
        } else {
            collected
        })
    }

    /// Drop the binding and chat against a brand-new session.
    pub async fn new_chat(
        &self,
        message: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        self.sessions.clear(channel, chat_id).await;
        info!(channel, chat_id, "starting fresh session");
        self.chat(message, channel, chat_id).await
    }
}

/// Insert the history block immediately before the user-message marker,
/// or prepend it when the marker is absent.
fn splice_history(message: &str, history: &str) -> String {
    match message.find(USER_MESSAGE_MARKER) {
        Some(idx) => format!("{}{history}\n\n{}", &message[..idx], &message[idx..]),
        None => format!("{history}\n\n{message}"),
    }
}

#[async_trait]
impl AgentBackend for AgentAdapter {
    async fn chat(
        &self,
        message: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        AgentAdapter::chat(self, message, channel, chat_id).await
    }

    async fn chat_stream(
        &self,
        message: &str,
        channel: &str,
        chat_id: &str,
        on_chunk: ChunkHandler,
    ) -> Result<String, AgentError> {
        AgentAdapter::chat_stream(self, message, channel, chat_id, on_chunk).await
    }

    async fn clear_session(&self, channel: &str, chat_id: &str) -> bool {
        self.sessions.clear(channel, chat_id).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StopReason;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport whose first N prompts fail with an invalid-session error.
    struct ScriptedTransport {
        invalid_until: usize,
        prompts: std::sync::Mutex<Vec<(String, String)>>,
        created: AtomicUsize,
        chunks: Vec<(&'static str, bool)>,
    }

    impl ScriptedTransport {
        fn new(invalid_until: usize) -> Self {
            Self {
                invalid_until,
                prompts: std::sync::Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                chunks: Vec::new(),
            }
        }

        fn with_chunks(mut self, chunks: Vec<(&'static str, bool)>) -> Self {
            self.chunks = chunks;
            self
        }
    }

    #[async_trait]
    impl AgentTransport for ScriptedTransport {
        async fn start(&self) -> Result<(), AgentError> {
            Ok(())
        }

        async fn initialize(&self) -> Result<serde_json::Value, AgentError> {
            Ok(json!({}))
        }

        async fn authenticate(&self, _method_id: &str) -> Result<bool, AgentError> {
            Ok(true)
        }

        async fn create_session(&self, _opts: &SessionOptions) -> Result<String, AgentError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("session-{n}"))
        }

        async fn load_session(&self, _session_id: &str, _cwd: &Path) -> Result<bool, AgentError> {
            Ok(true)
        }

        async fn prompt(
            &self,
            session_id: &str,
            text: &str,
            on_update: Option<UpdateHandler>,
            _timeout: Duration,
        ) -> Result<PromptOutcome, AgentError> {
            let call_index = {
                let mut prompts = self.prompts.lock().unwrap();
                prompts.push((session_id.to_owned(), text.to_owned()));
                prompts.len()
            };

            if call_index <= self.invalid_until {
                return Ok(PromptOutcome {
                    error: Some("Invalid request: session not found".into()),
                    stop_reason: StopReason::Error,
                    ..PromptOutcome::default()
                });
            }

            let mut content = String::new();
            if let Some(handler) = &on_update {
                for (chunk, is_thought) in &self.chunks {
                    if !is_thought {
                        content.push_str(chunk);
                    }
                    handler(SessionUpdate::MessageChunk {
                        text: (*chunk).to_owned(),
                        is_thought: *is_thought,
                    })
                    .await;
                }
            }
            if content.is_empty() {
                content = "retry response".into();
            }

            Ok(PromptOutcome {
                content,
                stop_reason: StopReason::EndTurn,
                ..PromptOutcome::default()
            })
        }

        async fn cancel(&self, _session_id: &str) {}

        async fn stop(&self) {}
    }

    fn adapter_with(
        transport: Arc<ScriptedTransport>,
        dir: &tempfile::TempDir,
    ) -> AgentAdapter {
        let sessions = Arc::new(SessionStore::open(dir.path().join("session_map.json")));
        AgentAdapter::new(
            transport,
            sessions,
            AdapterConfig {
                workspace: dir.path().to_path_buf(),
                model: "glm-5".into(),
                timeout: Duration::from_secs(5),
                thinking: false,
                sessions_dir: dir.path().join("transcripts"),
            },
        )
    }

    fn write_transcript(dir: &Path, session_id: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let doc = json!({
            "chatHistory": [
                {"role": "user", "parts": [{"text": "用户消息: previous Q"}]},
                {"role": "model", "parts": [{"text": "previous A with enough length"}]},
            ],
        });
        std::fs::write(
            dir.join(format!("{session_id}.json")),
            serde_json::to_string(&doc).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn chat_creates_and_reuses_session() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(0));
        let adapter = adapter_with(transport.clone(), &dir);

        adapter.chat("hello", "telegram", "42").await.unwrap();
        adapter.chat("again", "telegram", "42").await.unwrap();

        assert_eq!(transport.created.load(Ordering::SeqCst), 1);
        let prompts = transport.prompts.lock().unwrap();
        assert_eq!(prompts[0].0, "session-1");
        assert_eq!(prompts[1].0, "session-1");
    }

    #[tokio::test]
    async fn invalidation_recovery_replays_history() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(1));
        let adapter = adapter_with(transport.clone(), &dir);

        // Pre-bind the stale session and give it a transcript.
        adapter
            .sessions
            .bind("telegram", "7", "session-old")
            .await
            .unwrap();
        write_transcript(&dir.path().join("transcripts"), "session-old");

        let response = adapter
            .chat("用户消息: new question", "telegram", "7")
            .await
            .unwrap();
        assert_eq!(response, "retry response");

        let prompts = transport.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        // First attempt used the stale binding.
        assert_eq!(prompts[0].0, "session-old");
        // Retry runs on a fresh session with spliced history before the marker.
        assert_eq!(prompts[1].0, "session-1");
        let retry_text = &prompts[1].1;
        let history_pos = retry_text.find("<history_context>").unwrap();
        let marker_pos = retry_text.find("用户消息:").unwrap();
        assert!(history_pos < marker_pos);
        assert!(retry_text.contains("previous Q"));
        assert!(retry_text.contains("previous A"));

        // The new binding replaced the old one.
        assert_eq!(
            adapter.sessions.get("telegram", "7").as_deref(),
            Some("session-1")
        );
    }

    #[tokio::test]
    async fn second_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(2));
        let adapter = adapter_with(transport.clone(), &dir);

        let result = adapter.chat("hello", "telegram", "1").await;
        assert!(matches!(result, Err(AgentError::Chat(_))));
        assert_eq!(transport.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chat_stream_collects_non_thought_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(0).with_chunks(vec![
            ("visible ", false),
            ("secret thought", true),
            ("reply", false),
        ]));
        let adapter = adapter_with(transport, &dir);

        let forwarded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let forwarded_clone = forwarded.clone();
        let on_chunk: ChunkHandler = Arc::new(move |chunk: StreamChunk| {
            let forwarded = forwarded_clone.clone();
            Box::pin(async move {
                forwarded.lock().unwrap().push((chunk.text, chunk.is_thought));
            })
        });

        let response = adapter
            .chat_stream("go", "feishu", "oc_1", on_chunk)
            .await
            .unwrap();

        assert_eq!(response, "visible reply");
        // All chunks were forwarded, thoughts included.
        let forwarded = forwarded.lock().unwrap();
        assert_eq!(forwarded.len(), 3);
        assert!(forwarded[1].1);
    }

    #[tokio::test]
    async fn new_chat_rotates_session() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(0));
        let adapter = adapter_with(transport.clone(), &dir);

        adapter.chat("first", "qq", "u1").await.unwrap();
        let before = adapter.sessions.get("qq", "u1").unwrap();

        adapter.new_chat("fresh start", "qq", "u1").await.unwrap();
        let after = adapter.sessions.get("qq", "u1").unwrap();

        assert_ne!(before, after);
        assert_eq!(transport.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn splice_before_marker() {
        let spliced = splice_history("context\n\n用户消息: hi", "<history_context>h</history_context>");
        let history_pos = spliced.find("<history_context>").unwrap();
        let marker_pos = spliced.find("用户消息:").unwrap();
        assert!(history_pos < marker_pos);
        assert!(spliced.starts_with("context"));
    }

    #[test]
    fn splice_prepends_without_marker() {
        let spliced = splice_history("plain message", "<history_context>h</history_context>");
        assert!(spliced.starts_with("<history_context>"));
        assert!(spliced.ends_with("plain message"));
    }
}
