//! Command implementations and shared CLI plumbing.

pub mod config_cmd;
pub mod cron;
pub mod gateway;
pub mod onboard;
pub mod sessions;
pub mod status;

use std::path::PathBuf;

use anyhow::Context;

use spanbot_types::config::{Config, data_dir};

/// Path of the config file, honoring an explicit override.
pub fn config_path(explicit: Option<&str>) -> PathBuf {
    match explicit {
        Some(path) => PathBuf::from(path),
        None => data_dir().join("config.json"),
    }
}

/// Load the configuration; a missing file yields the defaults.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    let path = config_path(explicit);
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config at {}", path.display()))
}

/// The PID file guarding against double-start.
pub fn pid_path() -> PathBuf {
    data_dir().join("spanbot.pid")
}

/// Cron store location shared with the scheduler service.
pub fn cron_store_path() -> PathBuf {
    data_dir().join("cron_jobs.json")
}

/// Session map location shared with the agent adapter.
pub fn session_map_path() -> PathBuf {
    data_dir().join("session_map.json")
}

/// Channel journal root used by the recorder.
pub fn recorder_dir() -> PathBuf {
    data_dir().join("channel")
}

/// Read the recorded gateway PID, if any.
pub fn read_pid() -> Option<u32> {
    std::fs::read_to_string(pid_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Whether a process with the given PID is alive.
#[cfg(unix)]
pub fn process_running(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Whether a process with the given PID is alive.
#[cfg(not(unix))]
pub fn process_running(_pid: u32) -> bool {
    // Without a portable liveness probe, trust the PID file.
    true
}
