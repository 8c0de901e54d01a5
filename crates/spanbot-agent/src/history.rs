//! Conversation history extraction for invalidation recovery.
//!
//! When a bound session id stops being accepted, the adapter rotates to a
//! fresh session and replays recent context extracted from the agent's
//! persisted transcript: a file per session whose `chatHistory` holds
//! `{role, parts: [{text}], timestamp?}` entries. The extraction keeps
//! the last 20 turns, slices user entries down to the text after the
//! `用户消息:` marker, truncates long model entries, and skips reminder
//! frames and injected workspace guides.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Maximum turns replayed into a fresh session.
pub const MAX_HISTORY_TURNS: usize = 20;

/// User entries outside this length range are dropped.
const USER_LEN_RANGE: std::ops::RangeInclusive<usize> = 2..=2000;

/// Model entries are truncated at this many characters.
const MODEL_TRUNCATE_AT: usize = 3000;

/// Model entries shorter than this are noise and dropped.
const MODEL_MIN_LEN: usize = 10;

/// Default location of the agent's persisted session transcripts.
pub fn default_sessions_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".iflow")
        .join("acp")
        .join("sessions")
}

/// Extract recent conversation turns from a session transcript.
///
/// Returns a `<history_context>...</history_context>` block, or `None`
/// when the transcript is missing or holds nothing worth replaying.
pub fn extract_history(sessions_dir: &Path, session_id: &str) -> Option<String> {
    let session_file = sessions_dir.join(format!("{session_id}.json"));
    if !session_file.exists() {
        debug!(session = session_id, "session transcript not found");
        return None;
    }

    let content = match std::fs::read_to_string(&session_file) {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, "failed to read session transcript");
            return None;
        }
    };
    let data: Value = match serde_json::from_str(&content) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "failed to parse session transcript");
            return None;
        }
    };

    let history = data.get("chatHistory")?.as_array()?;
    if history.is_empty() {
        return None;
    }

    let recent = if history.len() > MAX_HISTORY_TURNS {
        &history[history.len() - MAX_HISTORY_TURNS..]
    } else {
        &history[..]
    };

    let created_at = data.get("createdAt").and_then(|c| c.as_str());
    let mut conversations = Vec::new();

    for entry in recent {
        let role = entry.get("role").and_then(|r| r.as_str()).unwrap_or("");
        let full_text = join_parts(entry.get("parts"));
        if full_text.trim().is_empty() {
            continue;
        }

        match role {
            "user" => {
                let Some(idx) = full_text.find("用户消息:") else {
                    continue;
                };
                let content = full_text[idx + "用户消息:".len()..].trim();
                if !USER_LEN_RANGE.contains(&content.chars().count()) {
                    continue;
                }

                let timestamp = entry
                    .get("timestamp")
                    .and_then(|t| t.as_str())
                    .or(created_at);
                let time_str = timestamp.and_then(format_timestamp).unwrap_or_default();
                conversations.push(format!("{time_str}\nUser: {content}"));
            }
            "model" => {
                let mut content = full_text.trim().to_owned();
                if content.chars().count() > MODEL_TRUNCATE_AT {
                    content = content.chars().take(MODEL_TRUNCATE_AT).collect::<String>() + "...";
                }
                if content.contains("<system-reminder>") || content.contains("[AGENTS -") {
                    continue;
                }
                if content.chars().count() < MODEL_MIN_LEN {
                    continue;
                }
                conversations.push(format!("Me: {content}"));
            }
            _ => {}
        }
    }

    if conversations.is_empty() {
        return None;
    }

    info!(
        turns = conversations.len(),
        "extracted conversation history for replay"
    );
    Some(format!(
        "<history_context>\n{}\n</history_context>",
        conversations.join("\n\n")
    ))
}

fn join_parts(parts: Option<&Value>) -> String {
    let Some(parts) = parts.and_then(|p| p.as_array()) else {
        return String::new();
    };
    let mut text = String::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(|t| t.as_str())
            && !t.is_empty()
        {
            text.push_str(t);
            text.push('\n');
        }
    }
    text
}

fn format_timestamp(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_transcript(dir: &Path, session_id: &str, history: Value) -> PathBuf {
        let path = dir.join(format!("{session_id}.json"));
        let doc = json!({
            "createdAt": "2026-07-01T10:00:00Z",
            "chatHistory": history,
        });
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn missing_transcript_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_history(dir.path(), "session-none").is_none());
    }

    #[test]
    fn extracts_user_and_model_turns() {
        let dir = tempfile::tempdir().unwrap();
        write_transcript(
            dir.path(),
            "s1",
            json!([
                {
                    "role": "user",
                    "parts": [{"text": "[message_source]\nchannel: telegram\n[/message_source]\n\n用户消息: previous Q"}],
                    "timestamp": "2026-07-01T12:30:00Z",
                },
                {
                    "role": "model",
                    "parts": [{"text": "previous A with enough length"}],
                },
            ]),
        );

        let history = extract_history(dir.path(), "s1").unwrap();
        assert!(history.starts_with("<history_context>"));
        assert!(history.ends_with("</history_context>"));
        assert!(history.contains("User: previous Q"));
        assert!(history.contains("Me: previous A with enough length"));
        assert!(history.contains("2026-07-01 12:30:00"));
    }

    #[test]
    fn user_entries_without_marker_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_transcript(
            dir.path(),
            "s2",
            json!([
                {"role": "user", "parts": [{"text": "raw text without the marker"}]},
                {"role": "model", "parts": [{"text": "a sufficiently long answer"}]},
            ]),
        );

        let history = extract_history(dir.path(), "s2").unwrap();
        assert!(!history.contains("User:"));
        assert!(history.contains("Me: a sufficiently long answer"));
    }

    #[test]
    fn reminder_and_guide_frames_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_transcript(
            dir.path(),
            "s3",
            json!([
                {"role": "model", "parts": [{"text": "<system-reminder>internal note that is long</system-reminder>"}]},
                {"role": "model", "parts": [{"text": "[AGENTS - workspace guide] injected content here"}]},
                {"role": "model", "parts": [{"text": "short"}]},
            ]),
        );

        assert!(extract_history(dir.path(), "s3").is_none());
    }

    #[test]
    fn long_model_entries_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let long_text = "x".repeat(4000);
        write_transcript(
            dir.path(),
            "s4",
            json!([{"role": "model", "parts": [{"text": long_text}]}]),
        );

        let history = extract_history(dir.path(), "s4").unwrap();
        assert!(history.contains("..."));
        // 3000 chars + ellipsis, well under the raw 4000.
        assert!(history.chars().count() < 3200);
    }

    #[test]
    fn only_last_twenty_turns_kept() {
        let dir = tempfile::tempdir().unwrap();
        let turns: Vec<Value> = (0..30)
            .map(|i| {
                json!({
                    "role": "user",
                    "parts": [{"text": format!("用户消息: question number {i}")}],
                })
            })
            .collect();
        write_transcript(dir.path(), "s5", Value::Array(turns));

        let history = extract_history(dir.path(), "s5").unwrap();
        assert!(!history.contains("question number 9"));
        assert!(history.contains("question number 10"));
        assert!(history.contains("question number 29"));
    }

    #[test]
    fn user_length_bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let too_long = "y".repeat(2500);
        write_transcript(
            dir.path(),
            "s6",
            json!([
                {"role": "user", "parts": [{"text": "用户消息: a"}]},
                {"role": "user", "parts": [{"text": format!("用户消息: {too_long}")}]},
                {"role": "user", "parts": [{"text": "用户消息: keep this one"}]},
            ]),
        );

        let history = extract_history(dir.path(), "s6").unwrap();
        assert!(!history.contains("User: a\n"));
        assert!(!history.contains(&too_long));
        assert!(history.contains("User: keep this one"));
    }
}
