//! `spanbot status` -- gateway and store diagnostics.

use spanbot_agent::session::SessionStore;
use spanbot_services::cron::storage::load_sync;

use super::{
    config_path, cron_store_path, load_config, process_running, read_pid, session_map_path,
};

/// Print gateway status and store summaries.
pub fn run(config_override: Option<&str>) -> anyhow::Result<()> {
    match read_pid() {
        Some(pid) if process_running(pid) => println!("gateway: running (pid {pid})"),
        Some(pid) => println!("gateway: not running (stale PID file, pid {pid})"),
        None => println!("gateway: not running"),
    }

    let config = load_config(config_override)?;
    println!("config: {}", config_path(config_override).display());
    println!("workspace: {}", config.workspace().display());
    println!("agent mode: {:?}, model: {}", config.agent.mode, config.agent.model);

    let enabled = config.enabled_channels();
    if enabled.is_empty() {
        println!("channels: none enabled");
    } else {
        println!("channels: {}", enabled.join(", "));
    }

    let sessions = SessionStore::open(session_map_path()).list();
    println!("sessions: {} bound", sessions.len());

    match load_sync(&cron_store_path()) {
        Ok(store) => {
            let enabled_jobs = store.jobs.iter().filter(|j| j.enabled).count();
            println!("cron jobs: {} ({} enabled)", store.jobs.len(), enabled_jobs);
        }
        Err(e) => println!("cron jobs: unreadable ({e})"),
    }

    Ok(())
}
