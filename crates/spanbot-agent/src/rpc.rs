//! JSON-RPC 2.0 wire state shared by the stdio and WebSocket transports.
//!
//! [`RpcState`] owns request-id allocation, the pending-request map, and
//! the notification inbox. The transport's receive loop feeds every
//! decoded JSON object into [`dispatch`](RpcState::dispatch): objects
//! carrying an `id` resolve the matching pending future; everything else
//! lands on the unbounded notification queue, consumed by the prompt
//! interleaving loop.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Wire state for one transport connection.
pub struct RpcState {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    notify_tx: mpsc::UnboundedSender<Value>,
    notify_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl RpcState {
    /// Create fresh wire state.
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            notify_tx,
            notify_rx: tokio::sync::Mutex::new(notify_rx),
        }
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a pending request, returning the response future.
    pub fn register(&self, id: i64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        rx
    }

    /// Drop a pending request (timeout or failure cleanup).
    pub fn remove(&self, id: i64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Route one decoded message from the receive loop.
    pub fn dispatch(&self, message: Value) {
        if let Some(id) = message.get("id").and_then(|v| v.as_i64()) {
            if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
                let _ = tx.send(message);
            } else {
                debug!(id, "response for unknown request id, dropping");
            }
            return;
        }

        if self.notify_tx.send(message).is_err() {
            warn!("notification inbox closed, dropping message");
        }
    }

    /// Receive the next notification; `None` once the inbox is closed.
    pub async fn next_notification(&self) -> Option<Value> {
        self.notify_rx.lock().await.recv().await
    }

    /// Fail every pending request (connection lost, child exited).
    ///
    /// Dropping the senders wakes each waiter with a receive error, which
    /// the transports surface as `AgentError::ConnectionLost`.
    pub fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        let count = pending.len();
        pending.clear();
        if count > 0 {
            warn!(count, "failed pending agent requests after connection loss");
        }
    }
}

impl Default for RpcState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a JSON-RPC 2.0 request object.
pub fn make_request(id: i64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a JSON-RPC 2.0 notification object.
pub fn make_notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Extract the error message from a JSON-RPC error value.
pub fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string())
}
