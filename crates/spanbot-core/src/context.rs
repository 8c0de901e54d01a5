//! Prompt context assembly for agent turns.
//!
//! Every turn starts with a `[message_source]` block identifying the
//! originating channel and conversation, optionally followed by first-run
//! bootstrap or workspace guide content, and ends with the user's text
//! after the `用户消息:` marker. The marker is load-bearing: history
//! extraction and invalidation recovery locate the user's words by it.

use std::path::Path;

use chrono::Local;
use tracing::{info, warn};

/// Marker preceding the verbatim user text inside an assembled prompt.
pub const USER_MESSAGE_MARKER: &str = "用户消息:";

/// Build the `[message_source]` block for a turn.
pub fn build_message_source(channel: &str, chat_id: &str) -> String {
    let now = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!(
        "[message_source]\n\
         channel: {channel}\n\
         chat_id: {chat_id}\n\
         session: {channel}:{chat_id}\n\
         time: {now}\n\
         [/message_source]"
    )
}

/// Assemble the full prompt for a turn.
///
/// Layout: message source block, then either the `BOOTSTRAP.md` wrapper
/// (when the workspace still has one) or the `AGENTS.md` wrapper, then
/// `用户消息: {content}`.
pub fn assemble_prompt(workspace: &Path, channel: &str, chat_id: &str, content: &str) -> String {
    let source = build_message_source(channel, chat_id);
    let body = format!("{USER_MESSAGE_MARKER} {content}");

    if let Some(bootstrap) = read_injectable(workspace, "BOOTSTRAP.md") {
        info!(channel, chat_id, "injecting BOOTSTRAP.md");
        return format!(
            "{source}\n\n\
             [BOOTSTRAP - first-run setup - must execute]\n\
             This is the first-run bootstrap file. Follow its instructions to\n\
             complete your identity setup. When the setup is done, delete the\n\
             workspace BOOTSTRAP.md file.\n\n\
             {bootstrap}\n\
             [/BOOTSTRAP]\n\n\
             {body}"
        );
    }

    if let Some(agents) = read_injectable(workspace, "AGENTS.md") {
        return format!(
            "{source}\n\n\
             [AGENTS - workspace guide]\n\
             {agents}\n\
             See the sibling context files in the workspace for more background.\n\
             [/AGENTS]\n\n\
             {body}"
        );
    }

    format!("{source}\n\n{body}")
}

fn read_injectable(workspace: &Path, name: &str) -> Option<String> {
    let path = workspace.join(name);
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read injectable file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_source_fields() {
        let block = build_message_source("telegram", "42");
        assert!(block.starts_with("[message_source]"));
        assert!(block.contains("channel: telegram"));
        assert!(block.contains("chat_id: 42"));
        assert!(block.contains("session: telegram:42"));
        assert!(block.contains("time: "));
        assert!(block.ends_with("[/message_source]"));
    }

    #[test]
    fn plain_prompt_without_injection() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = assemble_prompt(dir.path(), "slack", "C1", "hello there");
        assert!(prompt.contains("[message_source]"));
        assert!(prompt.ends_with("用户消息: hello there"));
        assert!(!prompt.contains("[BOOTSTRAP"));
        assert!(!prompt.contains("[AGENTS"));
    }

    #[test]
    fn bootstrap_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("BOOTSTRAP.md"), "Set identity to Bob.").unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "guide text").unwrap();

        let prompt = assemble_prompt(dir.path(), "telegram", "42", "hi");
        assert!(prompt.contains("[BOOTSTRAP - first-run setup - must execute]"));
        assert!(prompt.contains("Set identity to Bob."));
        assert!(prompt.contains("delete the"));
        assert!(!prompt.contains("[AGENTS - workspace guide]"));
        assert!(prompt.contains("用户消息: hi"));
    }

    #[test]
    fn agents_injected_when_no_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "project conventions").unwrap();

        let prompt = assemble_prompt(dir.path(), "qq", "u9", "question");
        assert!(prompt.contains("[AGENTS - workspace guide]"));
        assert!(prompt.contains("project conventions"));
        assert!(prompt.contains("[/AGENTS]"));
    }

    #[test]
    fn marker_precedes_user_text() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = assemble_prompt(dir.path(), "qq", "u9", "the question");
        let marker_pos = prompt.find(USER_MESSAGE_MARKER).unwrap();
        assert!(prompt[marker_pos..].contains("the question"));
    }
}
