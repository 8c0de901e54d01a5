//! `spanbot onboard` -- scaffold config and workspace files.
//!
//! Creates `~/.spanbot/config.json` with documented defaults and seeds
//! the workspace with `BOOTSTRAP.md`, `AGENTS.md`, and `HEARTBEAT.md`
//! templates. Existing files are never overwritten.

use std::path::Path;

use anyhow::Context;

use spanbot_types::config::{Config, data_dir};

const BOOTSTRAP_TEMPLATE: &str = "\
# First-run setup

You are a personal assistant reachable over several chat platforms.

1. Pick a name and a short personality for yourself.
2. Write them into AGENTS.md next to this file.
3. Delete this BOOTSTRAP.md file when you are done.
";

const AGENTS_TEMPLATE: &str = "\
# Workspace guide

Describe here who the assistant is and how it should behave.
Sibling files in this workspace carry extra context.
";

const HEARTBEAT_TEMPLATE: &str = "\
# Heartbeat tasks

<!-- Lines that are headings, comments, or empty checkboxes are ignored.
     Add actionable items below to have the agent work on them
     periodically. -->

- [ ]
";

/// Create the data directory, default config, and workspace templates.
pub fn run() -> anyhow::Result<()> {
    let root = data_dir();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("failed to create {}", root.display()))?;

    let config_file = root.join("config.json");
    if write_if_absent(&config_file, &serde_json::to_string_pretty(&Config::default())?)? {
        println!("created {}", config_file.display());
    } else {
        println!("kept existing {}", config_file.display());
    }

    let workspace = Config::default().workspace();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create {}", workspace.display()))?;

    for (name, template) in [
        ("BOOTSTRAP.md", BOOTSTRAP_TEMPLATE),
        ("AGENTS.md", AGENTS_TEMPLATE),
        ("HEARTBEAT.md", HEARTBEAT_TEMPLATE),
    ] {
        let path = workspace.join(name);
        if write_if_absent(&path, template)? {
            println!("created {}", path.display());
        }
    }

    println!("\nonboarding complete; edit the config and run `spanbot gateway start`");
    Ok(())
}

/// Write `content` unless the file already exists. Returns whether a
/// file was created.
fn write_if_absent(path: &Path, content: &str) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_if_absent_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.md");

        assert!(write_if_absent(&path, "first").unwrap());
        assert!(!write_if_absent(&path, "second").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");
    }

    #[test]
    fn heartbeat_template_is_empty_of_tasks() {
        // The scaffolded heartbeat file must not trigger the agent.
        assert!(spanbot_services::heartbeat::is_heartbeat_empty(Some(
            HEARTBEAT_TEMPLATE
        )));
    }
}
