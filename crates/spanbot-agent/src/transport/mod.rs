//! The uniform agent transport contract and its three implementations.
//!
//! Every transport presents the same surface: `start`, `initialize`,
//! `authenticate`, `create_session`, `load_session`, `prompt`, `cancel`,
//! `stop`. The stdio and WebSocket transports speak framed JSON-RPC with
//! `session/update` notifications interleaved into a running prompt; the
//! one-shot CLI transport spawns the agent binary per turn and recovers
//! the session id from its output.

pub mod cli;
pub mod stdio;
pub mod ws;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::debug;

use spanbot_types::error::AgentError;

use crate::rpc::{RpcState, error_message};

/// Protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: i64 = 1;

/// Longest single wait inside the prompt interleaving loop.
const PROMPT_SLICE: Duration = Duration::from_secs(5);

/// Capabilities advertised by the agent in the `initialize` response.
pub type AgentCapabilities = Value;

/// Why a prompt turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The agent finished its turn normally.
    #[default]
    EndTurn,
    /// The agent ran out of output tokens.
    MaxTokens,
    /// The agent refused the request.
    Refusal,
    /// The turn was cancelled.
    Cancelled,
    /// The agent reported an error.
    Error,
}

impl StopReason {
    /// Parse the wire value, defaulting to [`StopReason::EndTurn`].
    pub fn parse(value: &str) -> Self {
        match value {
            "max_tokens" => Self::MaxTokens,
            "refusal" => Self::Refusal,
            "cancelled" => Self::Cancelled,
            "error" => Self::Error,
            _ => Self::EndTurn,
        }
    }
}

/// A tool invocation reported by the agent during a turn.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Agent-assigned tool call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Lifecycle status (`pending`, `in_progress`, `completed`, ...).
    pub status: String,
    /// Tool arguments as reported.
    pub args: Value,
    /// Accumulated tool output text.
    pub output: String,
}

/// Final result of one prompt turn.
#[derive(Debug, Clone, Default)]
pub struct PromptOutcome {
    /// Concatenated non-thought message chunks.
    pub content: String,
    /// Concatenated thought chunks.
    pub thought: String,
    /// Tool calls observed during the turn.
    pub tool_calls: Vec<ToolCall>,
    /// Why the turn ended.
    pub stop_reason: StopReason,
    /// Error text when `stop_reason` is [`StopReason::Error`].
    pub error: Option<String>,
    /// Session id recovered from process output (one-shot CLI transport).
    pub session_id: Option<String>,
}

/// One `session/update` event surfaced during a prompt.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// A message or thought fragment.
    MessageChunk {
        /// Fragment text (delta).
        text: String,
        /// Whether this belongs to the thought stream.
        is_thought: bool,
    },
    /// A tool call started or changed state.
    ToolCall(ToolCall),
}

/// Async handler invoked from the prompt task for each update.
pub type UpdateHandler = Arc<dyn Fn(SessionUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Parameters for `session/new`.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Working directory for the session.
    pub cwd: PathBuf,
    /// Model id to select, if any.
    pub model: Option<String>,
    /// Permission mode (the gateway always runs `yolo`).
    pub approval_mode: String,
}

impl SessionOptions {
    /// Session options rooted at `cwd` with yolo approvals.
    pub fn new(cwd: PathBuf, model: Option<String>) -> Self {
        Self {
            cwd,
            model,
            approval_mode: "yolo".into(),
        }
    }
}

/// The uniform transport contract.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Establish the channel (spawn the child / open the socket).
    async fn start(&self) -> Result<(), AgentError>;

    /// Negotiate protocol version and capabilities. Must complete before
    /// any session call; idempotent once done.
    async fn initialize(&self) -> Result<AgentCapabilities, AgentError>;

    /// Optional authentication; returns whether the method was accepted.
    async fn authenticate(&self, method_id: &str) -> Result<bool, AgentError>;

    /// Create a new session and return its id.
    async fn create_session(&self, opts: &SessionOptions) -> Result<String, AgentError>;

    /// Load an existing session; `false` when the agent rejected the id.
    async fn load_session(&self, session_id: &str, cwd: &Path) -> Result<bool, AgentError>;

    /// Send a prompt and interleave updates until the final result.
    async fn prompt(
        &self,
        session_id: &str,
        text: &str,
        on_update: Option<UpdateHandler>,
        timeout: Duration,
    ) -> Result<PromptOutcome, AgentError>;

    /// Fire-and-forget cancellation of the session's running turn.
    async fn cancel(&self, session_id: &str);

    /// Graceful shutdown; forcibly kill a child after 5 s.
    async fn stop(&self);
}

/// Drive a prompt to completion: race the correlated response against the
/// notification inbox, dispatching `session/update` events to the handler
/// from this task (never from the receive loop, preserving per-turn
/// ordering).
pub(crate) async fn drive_prompt(
    rpc: &RpcState,
    mut response_rx: oneshot::Receiver<Value>,
    session_id: &str,
    on_update: Option<&UpdateHandler>,
    timeout: Duration,
) -> Result<PromptOutcome, AgentError> {
    let start = Instant::now();
    let mut outcome = PromptOutcome::default();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    let response = loop {
        let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
            return Err(AgentError::Timeout {
                operation: "session/prompt".into(),
            });
        };
        let slice = remaining.min(PROMPT_SLICE);

        tokio::select! {
            // Biased so queued updates drain before the final response is
            // taken: every chunk is dispatched ahead of the turn result.
            biased;

            note = tokio::time::timeout(slice, rpc.next_notification()) => {
                match note {
                    Err(_) => continue,
                    Ok(None) => {
                        return Err(AgentError::ConnectionLost(
                            "notification inbox closed".into(),
                        ));
                    }
                    Ok(Some(msg)) => {
                        handle_session_update(
                            &msg,
                            session_id,
                            &mut outcome,
                            &mut tool_calls,
                            on_update,
                        )
                        .await;
                    }
                }
            }

            response = &mut response_rx => {
                break response.map_err(|_| {
                    AgentError::ConnectionLost("agent connection closed mid-prompt".into())
                })?;
            }
        }
    };

    if let Some(error) = response.get("error") {
        outcome.error = Some(error_message(error));
        outcome.stop_reason = StopReason::Error;
    } else {
        let stop = response
            .pointer("/result/stopReason")
            .and_then(|v| v.as_str())
            .unwrap_or("end_turn");
        outcome.stop_reason = StopReason::parse(stop);
    }

    outcome.tool_calls = tool_calls;
    Ok(outcome)
}

async fn handle_session_update(
    msg: &Value,
    session_id: &str,
    outcome: &mut PromptOutcome,
    tool_calls: &mut Vec<ToolCall>,
    on_update: Option<&UpdateHandler>,
) {
    if msg.get("method").and_then(|m| m.as_str()) != Some("session/update") {
        debug!(
            method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("?"),
            "ignoring non-update notification"
        );
        return;
    }

    let params = msg.get("params").cloned().unwrap_or(Value::Null);
    if let Some(sid) = params.get("sessionId").and_then(|s| s.as_str())
        && sid != session_id
    {
        debug!(session = sid, "skipping update for another session");
        return;
    }

    let update = params.get("update").cloned().unwrap_or(Value::Null);
    let kind = update
        .get("sessionUpdate")
        .and_then(|k| k.as_str())
        .unwrap_or("");

    match kind {
        "agent_message_chunk" | "agent_thought_chunk" => {
            let is_thought = kind == "agent_thought_chunk";
            let text = update
                .pointer("/content/text")
                .and_then(|t| t.as_str())
                .unwrap_or("");
            if text.is_empty() {
                return;
            }
            if is_thought {
                outcome.thought.push_str(text);
            } else {
                outcome.content.push_str(text);
            }
            if let Some(handler) = on_update {
                handler(SessionUpdate::MessageChunk {
                    text: text.to_owned(),
                    is_thought,
                })
                .await;
            }
        }
        "tool_call" => {
            let call = ToolCall {
                id: str_field(&update, "toolCallId"),
                name: str_field(&update, "name"),
                status: "pending".into(),
                args: update.get("args").cloned().unwrap_or(Value::Null),
                output: String::new(),
            };
            tool_calls.push(call.clone());
            if let Some(handler) = on_update {
                handler(SessionUpdate::ToolCall(call)).await;
            }
        }
        "tool_call_update" => {
            let id = str_field(&update, "toolCallId");
            let status = str_field(&update, "status");
            let output = collect_content_text(update.get("content"));

            if let Some(call) = tool_calls.iter_mut().find(|c| c.id == id) {
                if !status.is_empty() {
                    call.status = status;
                }
                if !output.is_empty() {
                    call.output = output;
                }
                let updated = call.clone();
                if let Some(handler) = on_update {
                    handler(SessionUpdate::ToolCall(updated)).await;
                }
            }
        }
        other => {
            debug!(kind = other, "unhandled session update kind");
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned()
}

/// Gather `text` parts out of a `content` field that may be a single
/// object or a list of objects.
fn collect_content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|c| c.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
            .collect(),
        Some(obj) if obj.get("type").and_then(|t| t.as_str()) == Some("text") => obj
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_owned(),
        _ => String::new(),
    }
}

/// The `initialize` request parameters every transport sends.
pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": {
                "readTextFile": true,
                "writeTextFile": true,
            }
        }
    })
}

/// The `session/new` request parameters.
pub(crate) fn session_new_params(opts: &SessionOptions) -> Value {
    let mut settings = serde_json::Map::new();
    settings.insert(
        "permission_mode".into(),
        Value::String(opts.approval_mode.clone()),
    );
    if let Some(model) = &opts.model {
        settings.insert("model".into(), Value::String(model.clone()));
    }

    json!({
        "cwd": opts.cwd.to_string_lossy(),
        "mcpServers": [],
        "settings": settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn stop_reason_parse() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("refusal"), StopReason::Refusal);
        assert_eq!(StopReason::parse("cancelled"), StopReason::Cancelled);
        assert_eq!(StopReason::parse("error"), StopReason::Error);
        assert_eq!(StopReason::parse("anything else"), StopReason::EndTurn);
    }

    #[test]
    fn initialize_params_shape() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], 1);
        assert_eq!(params["clientCapabilities"]["fs"]["readTextFile"], true);
        assert_eq!(params["clientCapabilities"]["fs"]["writeTextFile"], true);
    }

    #[test]
    fn session_new_params_with_model() {
        let opts = SessionOptions::new(PathBuf::from("/tmp/ws"), Some("glm-5".into()));
        let params = session_new_params(&opts);
        assert_eq!(params["cwd"], "/tmp/ws");
        assert_eq!(params["mcpServers"], json!([]));
        assert_eq!(params["settings"]["permission_mode"], "yolo");
        assert_eq!(params["settings"]["model"], "glm-5");
    }

    #[test]
    fn collect_content_text_variants() {
        assert_eq!(
            collect_content_text(Some(&json!([
                {"type": "text", "text": "a"},
                {"type": "image"},
                {"type": "text", "text": "b"},
            ]))),
            "ab"
        );
        assert_eq!(
            collect_content_text(Some(&json!({"type": "text", "text": "solo"}))),
            "solo"
        );
        assert_eq!(collect_content_text(None), "");
    }

    fn update_msg(session: &str, kind: &str, body: Value) -> Value {
        let mut update = body;
        update["sessionUpdate"] = json!(kind);
        json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"sessionId": session, "update": update},
        })
    }

    #[tokio::test]
    async fn drive_prompt_interleaves_chunks_and_response() {
        let rpc = RpcState::new();
        let id = rpc.next_id();
        let rx = rpc.register(id);

        rpc.dispatch(update_msg(
            "s1",
            "agent_message_chunk",
            json!({"content": {"type": "text", "text": "Hello "}}),
        ));
        rpc.dispatch(update_msg(
            "s1",
            "agent_thought_chunk",
            json!({"content": {"type": "text", "text": "thinking..."}}),
        ));
        rpc.dispatch(update_msg(
            "s1",
            "agent_message_chunk",
            json!({"content": {"type": "text", "text": "world"}}),
        ));
        rpc.dispatch(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"stopReason": "end_turn"},
        }));

        let seen: Arc<StdMutex<Vec<(String, bool)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: UpdateHandler = Arc::new(move |update| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                if let SessionUpdate::MessageChunk { text, is_thought } = update {
                    seen.lock().unwrap().push((text, is_thought));
                }
            })
        });

        let outcome = drive_prompt(&rpc, rx, "s1", Some(&handler), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.content, "Hello world");
        assert_eq!(outcome.thought, "thinking...");
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert!(outcome.error.is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], ("thinking...".to_owned(), true));
    }

    #[tokio::test]
    async fn drive_prompt_skips_other_sessions() {
        let rpc = RpcState::new();
        let id = rpc.next_id();
        let rx = rpc.register(id);

        rpc.dispatch(update_msg(
            "other",
            "agent_message_chunk",
            json!({"content": {"type": "text", "text": "not mine"}}),
        ));
        rpc.dispatch(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"stopReason": "end_turn"},
        }));

        let outcome = drive_prompt(&rpc, rx, "mine", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.content.is_empty());
    }

    #[tokio::test]
    async fn drive_prompt_tracks_tool_calls() {
        let rpc = RpcState::new();
        let id = rpc.next_id();
        let rx = rpc.register(id);

        rpc.dispatch(update_msg(
            "s1",
            "tool_call",
            json!({"toolCallId": "t1", "name": "read_file", "args": {"path": "/x"}}),
        ));
        rpc.dispatch(update_msg(
            "s1",
            "tool_call_update",
            json!({
                "toolCallId": "t1",
                "status": "completed",
                "content": [{"type": "text", "text": "file body"}],
            }),
        ));
        rpc.dispatch(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"stopReason": "end_turn"},
        }));

        let outcome = drive_prompt(&rpc, rx, "s1", None, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "read_file");
        assert_eq!(outcome.tool_calls[0].status, "completed");
        assert_eq!(outcome.tool_calls[0].output, "file body");
    }

    #[tokio::test]
    async fn drive_prompt_maps_rpc_error() {
        let rpc = RpcState::new();
        let id = rpc.next_id();
        let rx = rpc.register(id);

        rpc.dispatch(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32600, "message": "Invalid request: session not found"},
        }));

        let outcome = drive_prompt(&rpc, rx, "s1", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Error);
        assert!(outcome.error.unwrap().contains("Invalid request"));
    }

    #[tokio::test]
    async fn drive_prompt_times_out() {
        let rpc = RpcState::new();
        let id = rpc.next_id();
        let rx = rpc.register(id);

        let result = drive_prompt(&rpc, rx, "s1", None, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AgentError::Timeout { .. })));
    }

    #[tokio::test]
    async fn drive_prompt_connection_lost() {
        let rpc = RpcState::new();
        let id = rpc.next_id();
        let rx = rpc.register(id);
        rpc.fail_all_pending();

        let result = drive_prompt(&rpc, rx, "s1", None, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AgentError::ConnectionLost(_))));
    }
}
