//! Whole-file JSON persistence for the cron store.
//!
//! The store is a single JSON document rewritten in full after every
//! mutation, execution, and rearm. Writes go through a temp file plus
//! rename so a crash never leaves a half-written store. Synchronous
//! variants exist for the CLI, which edits the same file out-of-process.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use spanbot_types::cron::CronStore;

use crate::error::Result;

/// File-backed cron store.
pub struct CronStorage {
    path: PathBuf,
}

impl CronStorage {
    /// Create a storage handle for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store; a missing or malformed file yields the default.
    pub async fn load(&self) -> Result<CronStore> {
        if !self.path.exists() {
            return Ok(CronStore::default());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        match serde_json::from_str(&content) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed cron store, starting fresh");
                Ok(CronStore::default())
            }
        }
    }

    /// Rewrite the whole store atomically.
    pub async fn save(&self, store: &CronStore) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(store)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(jobs = store.jobs.len(), "cron store saved");
        Ok(())
    }

    /// Modification time of the backing file, for external-edit detection.
    pub fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Synchronous load for the CLI.
pub fn load_sync(path: &Path) -> Result<CronStore> {
    if !path.exists() {
        return Ok(CronStore::default());
    }
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(store) => Ok(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed cron store, starting fresh");
            Ok(CronStore::default())
        }
    }
}

/// Synchronous atomic save for the CLI.
pub fn save_sync(path: &Path, store: &CronStore) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(store)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
