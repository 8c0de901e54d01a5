//! WebSocket JSON-RPC transport.
//!
//! Connects to a running agent's ACP endpoint and exchanges one JSON
//! object per WebSocket text frame. Classification is identical to the
//! stdio transport: frames carrying an `id` resolve pending requests,
//! everything else goes to the notification inbox. Frames that are not
//! JSON objects are logged and skipped.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_types::error::AgentError;

use crate::rpc::{RpcState, error_message, make_notification, make_request};

use super::{
    AgentCapabilities, AgentTransport, PromptOutcome, SessionOptions, UpdateHandler, drive_prompt,
    initialize_params, session_new_params,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Timeout for the best-effort `session/set_model` calls.
const SET_MODEL_TIMEOUT: Duration = Duration::from_secs(10);

struct WsHandle {
    sink: WsSink,
    recv_cancel: CancellationToken,
}

/// JSON-RPC over a WebSocket connection to a running agent.
pub struct WsTransport {
    url: String,
    default_timeout: Duration,
    rpc: Arc<RpcState>,
    inner: Mutex<Option<WsHandle>>,
    initialized: AtomicBool,
    capabilities: Mutex<Value>,
}

impl WsTransport {
    /// Create a transport for `ws://{host}:{port}/acp`.
    pub fn new(host: &str, port: u16, default_timeout: Duration) -> Self {
        Self {
            url: format!("ws://{host}:{port}/acp"),
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

        let text = serde_json::to_string(message)?;
        handle
            .sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| AgentError::ConnectionLost(format!("ws send failed: {e}")))
    }

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
        debug!(method, id, "ws request sent");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(AgentError::ConnectionLost("ws connection closed".into()));
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
impl AgentTransport for WsTransport {
    async fn start(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }

        let (socket, _) = connect_async(&self.url)
            .await
            .map_err(|e| AgentError::ConnectionLost(format!("ws connect failed: {e}")))?;
        let (sink, mut stream) = socket.split();

        let recv_cancel = CancellationToken::new();
        let rpc = self.rpc.clone();
        let cancel = recv_cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                let raw = text.trim();
                                if raw.is_empty() {
                                    continue;
                                }
                                if !raw.starts_with('{') {
                                    debug!("ws non-JSON frame, skipping");
                                    continue;
                                }
                                match serde_json::from_str::<Value>(raw) {
                                    Ok(message) => rpc.dispatch(message),
                                    Err(e) => debug!(error = %e, "skipping unparseable ws frame"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("ws connection closed by agent");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                error!(error = %e, "ws receive failed");
                                break;
                            }
                        }
                    }
                }
            }
            rpc.fail_all_pending();
            debug!("ws receive loop ended");
        });

        info!(url = %self.url, "ws transport connected");
        *inner = Some(WsHandle { sink, recv_cancel });
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
            "ws transport initialized"
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
            Ok(result) => Ok(result.get("methodId").and_then(|m| m.as_str()) == Some(method_id)),
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

        if let Some(model) = &opts.model
            && self
                .request(
                    "session/set_model",
                    json!({"sessionId": session_id, "modelId": model}),
                    SET_MODEL_TIMEOUT,
                )
                .await
                .is_err()
            && let Err(e) = self
                .request(
                    "session/set_config_option",
                    json!({"sessionId": session_id, "configId": "model", "value": model}),
                    SET_MODEL_TIMEOUT,
                )
                .await
        {
            debug!(error = %e, "model selection failed on both methods");
        }

        info!("ws agent session created");
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
                warn!(error = %e, "session load rejected");
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
        let _ = handle.sink.send(Message::Close(None)).await;
        let _ = handle.sink.close().await;

        self.initialized.store(false, Ordering::SeqCst);
        self.rpc.fail_all_pending();
        info!("ws transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_construction() {
        let transport = WsTransport::new("localhost", 8090, Duration::from_secs(5));
        assert_eq!(transport.url, "ws://localhost:8090/acp");
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let transport = WsTransport::new("localhost", 8090, Duration::from_secs(5));
        let result = transport.send_raw(&json!({"jsonrpc": "2.0"})).await;
        assert!(matches!(result, Err(AgentError::NotStarted)));
    }

    #[tokio::test]
    async fn connect_failure_maps_to_connection_lost() {
        // Port 1 is essentially never listening.
        let transport = WsTransport::new("127.0.0.1", 1, Duration::from_secs(5));
        let result = transport.start().await;
        assert!(matches!(result, Err(AgentError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let transport = WsTransport::new("localhost", 8090, Duration::from_secs(5));
        transport.stop().await;
    }
}
