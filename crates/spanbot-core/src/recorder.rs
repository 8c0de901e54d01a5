//! Channel message journaling.
//!
//! [`ChannelRecorder`] writes every inbound (user) and outbound (agent)
//! message to per-`(channel, chat_id, utc-date)` JSON files under the data
//! directory so sessions can be inspected after the fact. Pure progress
//! frames and empty stream terminators are skipped; mid-stream snapshots
//! are recorded because they carry the cumulative content.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use spanbot_types::event::{InboundMessage, OutboundMessage};

/// Hook invoked synchronously by the bus on every accepted publish.
pub trait BusRecorder: Send + Sync {
    /// Record an accepted inbound message.
    fn record_inbound(&self, msg: &InboundMessage);

    /// Record an accepted outbound message.
    fn record_outbound(&self, msg: &OutboundMessage);
}

/// Records channel traffic to JSON files.
///
/// Layout: `{root}/{channel}/{chat_id}-{YYYY-MM-DD}.json`, each file a
/// document `{channel, chat_id, date, messages: [...]}`.
pub struct ChannelRecorder {
    root: PathBuf,
}

impl ChannelRecorder {
    /// Create a recorder rooted at the given directory.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn file_for(&self, channel: &str, chat_id: &str) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.root.join(channel).join(format!("{chat_id}-{date}.json"))
    }

    fn load(&self, path: &Path, channel: &str, chat_id: &str) -> serde_json::Value {
        if let Ok(content) = std::fs::read_to_string(path)
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(&content)
        {
            return value;
        }
        json!({
            "channel": channel,
            "chat_id": chat_id,
            "date": Utc::now().format("%Y-%m-%d").to_string(),
            "messages": [],
        })
    }

    fn append(&self, channel: &str, chat_id: &str, entry: serde_json::Value) {
        let path = self.file_for(channel, chat_id);
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(error = %e, "failed to create recorder directory");
            return;
        }

        let mut data = self.load(&path, channel, chat_id);
        if let Some(messages) = data.get_mut("messages").and_then(|m| m.as_array_mut()) {
            messages.push(entry);
        }

        match serde_json::to_string_pretty(&data) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    warn!(path = %path.display(), error = %e, "failed to write channel log");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize channel log"),
        }
        debug!(channel, chat_id, "recorded message");
    }
}

impl BusRecorder for ChannelRecorder {
    fn record_inbound(&self, msg: &InboundMessage) {
        let entry = json!({
            "id": short_id(),
            "timestamp": Utc::now().to_rfc3339(),
            "direction": "inbound",
            "role": "user",
            "content": msg.content,
            "chat_id": msg.chat_id,
            "sender_id": msg.sender_id,
            "media": msg.media,
        });
        self.append(&msg.channel, &msg.chat_id, entry);
    }

    fn record_outbound(&self, msg: &OutboundMessage) {
        // Tool hints and other progress-only frames never reach users.
        if msg.is_progress() && !msg.is_streaming() && !msg.is_streaming_end() {
            return;
        }
        // The empty terminator carries no content worth keeping.
        if msg.is_streaming_end() && msg.content.is_empty() {
            return;
        }

        let entry = json!({
            "id": short_id(),
            "timestamp": Utc::now().to_rfc3339(),
            "direction": "outbound",
            "role": "assistant",
            "content": msg.content,
            "chat_id": msg.chat_id,
            "reply_to": msg.reply_to,
            "is_streaming": msg.is_streaming(),
        });
        self.append(&msg.channel, &msg.chat_id, entry);
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanbot_types::event::{META_PROGRESS, META_STREAMING, META_STREAMING_END};

    fn recorder() -> (ChannelRecorder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ChannelRecorder::new(dir.path().to_path_buf()), dir)
    }

    fn read_messages(dir: &Path, channel: &str) -> Vec<serde_json::Value> {
        let channel_dir = dir.join(channel);
        let entries: Vec<_> = std::fs::read_dir(&channel_dir)
            .map(|rd| rd.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert_eq!(entries.len(), 1, "expected exactly one log file");
        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        let data: serde_json::Value = serde_json::from_str(&content).unwrap();
        data["messages"].as_array().unwrap().clone()
    }

    #[test]
    fn records_inbound_and_outbound() {
        let (rec, dir) = recorder();
        rec.record_inbound(&InboundMessage::new("telegram", "u1", "c1", "hi"));
        rec.record_outbound(&OutboundMessage::new("telegram", "c1", "hello"));

        let messages = read_messages(dir.path(), "telegram");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["direction"], "inbound");
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["direction"], "outbound");
        assert_eq!(messages[1]["content"], "hello");
    }

    #[test]
    fn skips_progress_only_frames() {
        let (rec, dir) = recorder();
        rec.record_outbound(
            &OutboundMessage::new("qq", "c1", "working...").with_flag(META_PROGRESS),
        );
        assert!(!dir.path().join("qq").exists());
    }

    #[test]
    fn skips_empty_terminator() {
        let (rec, dir) = recorder();
        rec.record_outbound(&OutboundMessage::new("qq", "c1", "").with_flag(META_STREAMING_END));
        assert!(!dir.path().join("qq").exists());
    }

    #[test]
    fn keeps_streaming_snapshot() {
        let (rec, dir) = recorder();
        rec.record_outbound(
            &OutboundMessage::new("qq", "c1", "cumulative text")
                .with_flag(META_STREAMING)
                .with_flag(META_PROGRESS),
        );
        let messages = read_messages(dir.path(), "qq");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["is_streaming"], true);
    }
}
