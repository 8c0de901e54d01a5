//! `spanbot sessions` -- list agent session bindings.

use comfy_table::{Table, presets::UTF8_FULL};

use spanbot_agent::session::SessionStore;

use super::session_map_path;

/// Print all session bindings.
pub fn run() -> anyhow::Result<()> {
    let store = SessionStore::open(session_map_path());
    let sessions = store.list();

    if sessions.is_empty() {
        println!("no session bindings");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Conversation", "Session"]);

    let mut entries: Vec<_> = sessions.into_iter().collect();
    entries.sort();
    for (key, session_id) in entries {
        table.add_row([key, session_id]);
    }
    println!("{table}");
    Ok(())
}
