//! Persistent session map: `(channel, chat_id)` → agent session id.
//!
//! The whole map lives in a single JSON object file. Reads are served
//! from a copy-on-write snapshot and never touch the lock that writers
//! hold; every mutation rewrites the file atomically (temp + rename)
//! under a process-wide writer mutex.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use spanbot_types::error::AgentError;

/// Session bindings persisted to a single JSON file.
pub struct SessionStore {
    path: PathBuf,
    snapshot: RwLock<Arc<HashMap<String, String>>>,
    writer: Mutex<()>,
}

impl SessionStore {
    /// Open the store, loading any existing mapping file.
    ///
    /// An unreadable or malformed file starts the store fresh.
    pub fn open(path: PathBuf) -> Self {
        let map = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
                Ok(map) => {
                    debug!(count = map.len(), "loaded session mappings");
                    map
                }
                Err(e) => {
                    warn!(error = %e, "invalid session map file, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            snapshot: RwLock::new(Arc::new(map)),
            writer: Mutex::new(()),
        }
    }

    fn key(channel: &str, chat_id: &str) -> String {
        format!("{channel}:{chat_id}")
    }

    fn current(&self) -> Arc<HashMap<String, String>> {
        self.snapshot.read().expect("session snapshot poisoned").clone()
    }

    /// Look up the session bound to a conversation.
    pub fn get(&self, channel: &str, chat_id: &str) -> Option<String> {
        self.current().get(&Self::key(channel, chat_id)).cloned()
    }

    /// All current bindings.
    pub fn list(&self) -> HashMap<String, String> {
        (*self.current()).clone()
    }

    /// Bind a conversation to a session id and persist.
    pub async fn bind(
        &self,
        channel: &str,
        chat_id: &str,
        session_id: &str,
    ) -> Result<(), AgentError> {
        let _guard = self.writer.lock().await;

        let mut map = (*self.current()).clone();
        map.insert(Self::key(channel, chat_id), session_id.to_owned());
        self.persist(map).await?;

        info!(channel, chat_id, "session binding stored");
        Ok(())
    }

    /// Remove a binding and persist; returns the prior session id so the
    /// caller can reuse it for history extraction.
    pub async fn clear(&self, channel: &str, chat_id: &str) -> Option<String> {
        let _guard = self.writer.lock().await;

        let mut map = (*self.current()).clone();
        let old = map.remove(&Self::key(channel, chat_id))?;

        if let Err(e) = self.persist(map).await {
            warn!(error = %e, "failed to persist session map after clear");
        }
        info!(channel, chat_id, "session binding cleared");
        Some(old)
    }

    /// Swap the snapshot and rewrite the file atomically.
    async fn persist(&self, map: HashMap<String, String>) -> Result<(), AgentError> {
        let arc = Arc::new(map);
        *self.snapshot.write().expect("session snapshot poisoned") = arc.clone();

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&*arc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
