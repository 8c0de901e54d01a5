//! Heartbeat service: periodic agent wake-up.
//!
//! Every interval the service reads `HEARTBEAT.md` from the workspace.
//! A file that is missing or holds only headings, comments, and empty
//! checkboxes is a no-op. Otherwise the agent is prompted to work
//! through the file; a response containing `HEARTBEAT_OK` is dropped and
//! anything else is forwarded to the notify sink for user delivery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;

/// Token the agent replies with when there is nothing to report.
pub const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

/// The prompt sent to the agent on each heartbeat.
pub const HEARTBEAT_PROMPT: &str = "Read HEARTBEAT.md in your workspace and follow any \
     instructions listed there. If nothing needs attention, reply with exactly: HEARTBEAT_OK";

/// Default interval: 30 minutes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Callback driving an agent turn with the heartbeat prompt.
pub type HeartbeatFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Callback delivering a non-OK heartbeat response to the user.
pub type NotifyFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Periodically wakes the agent against the workspace heartbeat file.
pub struct HeartbeatService {
    workspace: PathBuf,
    interval: Duration,
    on_heartbeat: HeartbeatFn,
    on_notify: Option<NotifyFn>,
}

impl HeartbeatService {
    /// Create a heartbeat service over the given workspace.
    pub fn new(
        workspace: PathBuf,
        interval: Duration,
        on_heartbeat: HeartbeatFn,
        on_notify: Option<NotifyFn>,
    ) -> Self {
        Self {
            workspace,
            interval,
            on_heartbeat,
            on_notify,
        }
    }

    fn heartbeat_file(&self) -> PathBuf {
        self.workspace.join("HEARTBEAT.md")
    }

    /// Run until cancelled. The first beat happens after one full
    /// interval, not at startup.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat service started");
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat service shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One heartbeat check.
    pub async fn tick(&self) {
        let content = std::fs::read_to_string(self.heartbeat_file()).ok();
        if is_heartbeat_empty(content.as_deref()) {
            debug!("heartbeat: no actionable tasks");
            return;
        }

        info!("heartbeat: checking for tasks");
        match (self.on_heartbeat)(HEARTBEAT_PROMPT.to_owned()).await {
            Ok(response) => {
                if response.to_uppercase().contains(HEARTBEAT_OK_TOKEN) {
                    info!("heartbeat: OK, nothing to report");
                } else if let Some(notify) = &self.on_notify {
                    info!("heartbeat: delivering response");
                    notify(response).await;
                }
            }
            Err(e) => error!(error = %e, "heartbeat execution failed"),
        }
    }
}

/// Whether the heartbeat file holds no actionable content.
///
/// Empty lines, headings, HTML comments, and unchecked/checked-but-bare
/// checkboxes do not count as actionable.
pub fn is_heartbeat_empty(content: Option<&str>) -> bool {
    let Some(content) = content else {
        return true;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("<!--")
            || matches!(line, "- [ ]" | "* [ ]" | "- [x]" | "* [x]")
        {
            continue;
        }
        return false;
    }
    true
}
