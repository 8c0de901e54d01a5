//! Spawned-child stdio transport.
//!
//! Spawns `iflow --experimental-acp --stream` and speaks newline-delimited
//! JSON-RPC over its stdio. Lines not starting with `{` are routed to the
//! debug log rather than parsed; stderr is drained the same way. The
//! child is terminated gracefully on [`stop`](StdioTransport::stop) and
//! killed if it is still alive after five seconds.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_types::error::AgentError;

use crate::rpc::{RpcState, error_message, make_notification, make_request};

use super::{
    AgentCapabilities, AgentTransport, PromptOutcome, SessionOptions, UpdateHandler, drive_prompt,
    initialize_params, session_new_params,
};

/// How long to wait for the child to exit before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Timeout for the best-effort `session/set_model` calls.
const SET_MODEL_TIMEOUT: Duration = Duration::from_secs(10);

struct ChildHandle {
    child: Child,
    stdin: ChildStdin,
    recv_cancel: CancellationToken,
}

/// JSON-RPC over the stdio of a spawned agent child process.
pub struct StdioTransport {
    iflow_path: String,
    workspace: PathBuf,
    default_timeout: Duration,
    rpc: Arc<RpcState>,
    inner: Mutex<Option<ChildHandle>>,
    initialized: AtomicBool,
    capabilities: Mutex<Value>,
}

impl StdioTransport {
    /// Create a transport that will spawn `iflow_path` in `workspace`.
    pub fn new(iflow_path: String, workspace: PathBuf, default_timeout: Duration) -> Self {
        Self {
            iflow_path,
            workspace,
            default_timeout,
            rpc: Arc::new(RpcState::new()),
            inner: Mutex::new(None),
            initialized: AtomicBool::new(false),
            capabilities: Mutex::new(Value::Null),
        }
    }

    async fn send_raw(&self, message: &Value) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        let handle = inner.as_mut().ok_or(AgentError::NotStarted)?;

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        handle
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::ConnectionLost(format!("stdin write failed: {e}")))?;
        handle
            .stdin
            .flush()
            .await
            .map_err(|e| AgentError::ConnectionLost(format!("stdin flush failed: {e}")))?;
        Ok(())
    }

    /// Send a request and await the correlated response's `result`.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let id = self.rpc.next_id();
        let rx = self.rpc.register(id);

        if let Err(e) = self.send_raw(&make_request(id, method, params)).await {
            self.rpc.remove(id);
            return Err(e);
        }
        debug!(method, id, "stdio request sent");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(AgentError::ConnectionLost(
                    "agent connection closed".into(),
                ));
            }
            Err(_) => {
                self.rpc.remove(id);
                return Err(AgentError::Timeout {
                    operation: method.to_owned(),
                });
            }
        };

        if let Some(error) = response.get("error") {
            return Err(AgentError::Rpc(error_message(error)));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn ensure_initialized(&self) -> Result<(), AgentError> {
        if !self.initialized.load(Ordering::SeqCst) {
            self.initialize().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentTransport for StdioTransport {
    async fn start(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.iflow_path)
            .arg("--experimental-acp")
            .arg("--stream")
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Process(format!("failed to spawn {}: {e}", self.iflow_path))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Process("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Process("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let recv_cancel = CancellationToken::new();

        // Receive loop: decode stdout lines and route them to the wire state.
        let rpc = self.rpc.clone();
        let cancel = recv_cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(raw)) => {
                                let raw = raw.trim();
                                if raw.is_empty() {
                                    continue;
                                }
                                if !raw.starts_with('{') {
                                    debug!(line = %truncate(raw, 120), "agent non-JSON output");
                                    continue;
                                }
                                match serde_json::from_str::<Value>(raw) {
                                    Ok(message) => rpc.dispatch(message),
                                    Err(e) => {
                                        debug!(error = %e, "skipping unparseable agent frame");
                                    }
                                }
                            }
                            Ok(None) => {
                                warn!("agent stdout closed");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "agent stdout read failed");
                                break;
                            }
                        }
                    }
                }
            }
            rpc.fail_all_pending();
            debug!("stdio receive loop ended");
        });

        // Drain stderr so the child never blocks on a full pipe.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %truncate(&line, 200), "agent stderr");
                }
            });
        }

        info!(pid = child.id(), path = %self.iflow_path, "agent child started");

        *inner = Some(ChildHandle {
            child,
            stdin,
            recv_cancel,
        });
        Ok(())
    }

    async fn initialize(&self) -> Result<AgentCapabilities, AgentError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(self.capabilities.lock().await.clone());
        }

        let result = self
            .request("initialize", initialize_params(), self.default_timeout)
            .await?;

        let capabilities = result.get("agentCapabilities").cloned().unwrap_or(Value::Null);
        *self.capabilities.lock().await = capabilities.clone();
        self.initialized.store(true, Ordering::SeqCst);

        info!(
            version = result.get("protocolVersion").and_then(|v| v.as_i64()),
            "stdio transport initialized"
        );
        Ok(capabilities)
    }

    async fn authenticate(&self, method_id: &str) -> Result<bool, AgentError> {
        self.ensure_initialized().await?;

        match self
            .request(
                "authenticate",
                json!({"methodId": method_id}),
                self.default_timeout,
            )
            .await
        {
            Ok(result) => {
                let ok = result.get("methodId").and_then(|m| m.as_str()) == Some(method_id);
                if ok {
                    info!(method = method_id, "agent authenticated");
                }
                Ok(ok)
            }
            Err(AgentError::Rpc(e)) => {
                warn!(error = %e, "agent authentication rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_session(&self, opts: &SessionOptions) -> Result<String, AgentError> {
        self.ensure_initialized().await?;

        let result = self
            .request("session/new", session_new_params(opts), self.default_timeout)
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_owned();

        if let Some(model) = &opts.model {
            let set = self
                .request(
                    "session/set_model",
                    json!({"sessionId": session_id, "modelId": model}),
                    SET_MODEL_TIMEOUT,
                )
                .await;
            if let Err(e) = set {
                debug!(error = %e, "session/set_model failed, trying set_config_option");
                if let Err(e2) = self
                    .request(
                        "session/set_config_option",
                        json!({"sessionId": session_id, "configId": "model", "value": model}),
                        SET_MODEL_TIMEOUT,
                    )
                    .await
                {
                    debug!(error = %e2, "session/set_config_option failed");
                }
            }
        }

        info!(session = %truncate(&session_id, 16), "agent session created");
        Ok(session_id)
    }

    async fn load_session(&self, session_id: &str, cwd: &Path) -> Result<bool, AgentError> {
        self.ensure_initialized().await?;

        match self
            .request(
                "session/load",
                json!({
                    "sessionId": session_id,
                    "cwd": cwd.to_string_lossy(),
                    "mcpServers": [],
                }),
                self.default_timeout,
            )
            .await
        {
            Ok(result) => Ok(result.get("loaded").and_then(|l| l.as_bool()).unwrap_or(false)),
            Err(AgentError::Rpc(e)) => {
                warn!(session = %truncate(session_id, 16), error = %e, "session load rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn prompt(
        &self,
        session_id: &str,
        text: &str,
        on_update: Option<UpdateHandler>,
        timeout: Duration,
    ) -> Result<PromptOutcome, AgentError> {
        let id = self.rpc.next_id();
        let rx = self.rpc.register(id);

        let request = make_request(
            id,
            "session/prompt",
            json!({
                "sessionId": session_id,
                "prompt": [{"type": "text", "text": text}],
            }),
        );
        if let Err(e) = self.send_raw(&request).await {
            self.rpc.remove(id);
            return Err(e);
        }
        debug!(session = %truncate(session_id, 16), "prompt sent");

        match drive_prompt(&self.rpc, rx, session_id, on_update.as_ref(), timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ AgentError::Timeout { .. }) => {
                self.rpc.remove(id);
                self.cancel(session_id).await;
                Err(e)
            }
            Err(e) => {
                self.rpc.remove(id);
                Err(e)
            }
        }
    }

    async fn cancel(&self, session_id: &str) {
        let notification = make_notification("session/cancel", json!({"sessionId": session_id}));
        if let Err(e) = self.send_raw(&notification).await {
            warn!(error = %e, "failed to send session/cancel");
        }
    }

    async fn stop(&self) {
        let Some(mut handle) = self.inner.lock().await.take() else {
            return;
        };

        handle.recv_cancel.cancel();

        // Closing stdin asks the child to exit; kill it if it lingers.
        drop(handle.stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, handle.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "agent child exited"),
            Ok(Err(e)) => warn!(error = %e, "agent child wait failed"),
            Err(_) => {
                warn!("agent child did not exit in time, killing");
                if let Err(e) = handle.child.kill().await {
                    warn!(error = %e, "failed to kill agent child");
                }
            }
        }

        self.initialized.store(false, Ordering::SeqCst);
        self.rpc.fail_all_pending();
        info!("stdio transport stopped");
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 16), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("消息消息消息", 2), "消息");
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let transport = StdioTransport::new(
            "iflow".into(),
            PathBuf::from("/tmp"),
            Duration::from_secs(5),
        );
        let result = transport.send_raw(&json!({"jsonrpc": "2.0"})).await;
        assert!(matches!(result, Err(AgentError::NotStarted)));
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let transport = StdioTransport::new(
            "iflow".into(),
            PathBuf::from("/tmp"),
            Duration::from_secs(5),
        );
        transport.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_maps_to_process_error() {
        let transport = StdioTransport::new(
            "/nonexistent/iflow-binary".into(),
            std::env::temp_dir(),
            Duration::from_secs(5),
        );
        let result = transport.start().await;
        assert!(matches!(result, Err(AgentError::Process(_))));
    }
}
