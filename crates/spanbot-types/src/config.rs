//! Configuration schema for the spanbot gateway.
//!
//! The config is a single JSON document (default `~/.spanbot/config.json`)
//! deserialized with per-field defaults so a partial file works. Channel
//! sections are kept as raw JSON values plus the common fields every
//! connector understands (`enabled`, `allow_from`), because each connector
//! parses its own credentials.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Data root directory: `~/.spanbot`.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spanbot")
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent transport and model settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Gateway-level behavior (streaming, bus, recording).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel sections keyed by connector name.
    #[serde(default)]
    pub channels: HashMap<String, ChannelSection>,

    /// Heartbeat service settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Names of channels with `enabled = true`.
    pub fn enabled_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// The resolved agent workspace directory.
    pub fn workspace(&self) -> PathBuf {
        match &self.agent.workspace {
            Some(ws) if !ws.is_empty() => {
                if let Some(rest) = ws.strip_prefix("~/") {
                    dirs::home_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join(rest)
                } else {
                    PathBuf::from(ws)
                }
            }
            _ => data_dir().join("workspace"),
        }
    }
}

/// How the gateway talks to the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Spawn the agent as a child and speak JSON-RPC over stdio.
    #[default]
    Stdio,
    /// Connect to a running agent over WebSocket.
    Ws,
    /// Spawn the agent CLI once per turn.
    Cli,
}

/// Agent transport and model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Transport mode.
    #[serde(default)]
    pub mode: AgentMode,

    /// Path to the `iflow` binary.
    #[serde(default = "default_iflow_path")]
    pub iflow_path: String,

    /// WebSocket host for [`AgentMode::Ws`].
    #[serde(default = "default_acp_host")]
    pub acp_host: String,

    /// WebSocket port for [`AgentMode::Ws`].
    #[serde(default = "default_acp_port")]
    pub acp_port: u16,

    /// Default model id.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-turn timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Include the agent's thought stream in non-streaming replies.
    #[serde(default)]
    pub thinking: bool,

    /// Agent workspace directory (defaults to `~/.spanbot/workspace`).
    #[serde(default)]
    pub workspace: Option<String>,

    /// Directory holding the agent's persisted session transcripts
    /// (defaults to `~/.iflow/acp/sessions`).
    #[serde(default)]
    pub sessions_dir: Option<String>,
}

fn default_iflow_path() -> String {
    "iflow".into()
}

fn default_acp_host() -> String {
    "localhost".into()
}

fn default_acp_port() -> u16 {
    8090
}

fn default_model() -> String {
    "glm-5".into()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: AgentMode::Stdio,
            iflow_path: default_iflow_path(),
            acp_host: default_acp_host(),
            acp_port: default_acp_port(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            thinking: false,
            workspace: None,
            sessions_dir: None,
        }
    }
}

/// Gateway-level behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Whether streaming fan-out is enabled at all.
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Channels that may receive streamed output.
    #[serde(default = "default_streaming_channels")]
    pub streaming_channels: Vec<String>,

    /// Newline count that triggers a line-buffered flush (0 = no split).
    #[serde(default = "default_line_split_threshold")]
    pub line_split_threshold: usize,

    /// Bus queue capacity per direction.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Record inbound/outbound messages to per-channel JSON journals.
    #[serde(default)]
    pub record_messages: bool,
}

fn default_true() -> bool {
    true
}

fn default_streaming_channels() -> Vec<String> {
    vec!["feishu".into(), "telegram".into(), "qq".into()]
}

fn default_line_split_threshold() -> usize {
    5
}

fn default_bus_capacity() -> usize {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            streaming_channels: default_streaming_channels(),
            line_split_threshold: default_line_split_threshold(),
            bus_capacity: default_bus_capacity(),
            record_messages: false,
        }
    }
}

/// One channel's configuration section.
///
/// `enabled` and `allow_from` are understood by the manager; everything
/// else stays in `extra` for the connector's factory to interpret.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelSection {
    /// Whether this channel should be started.
    #[serde(default)]
    pub enabled: bool,

    /// Sender allow-list; empty means everyone is allowed.
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Connector-specific fields (tokens, app ids, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChannelSection {
    /// Look up a connector-specific string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Heartbeat service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether the heartbeat service runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minutes between heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,

    /// Channel that receives non-OK heartbeat responses.
    #[serde(default)]
    pub notify_channel: Option<String>,

    /// Chat id that receives non-OK heartbeat responses.
    #[serde(default)]
    pub notify_to: Option<String>,
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_heartbeat_interval(),
            notify_channel: None,
            notify_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.agent.mode, AgentMode::Stdio);
        assert_eq!(config.agent.model, "glm-5");
        assert_eq!(config.agent.timeout_secs, 300);
        assert_eq!(config.gateway.bus_capacity, 100);
        assert!(config.gateway.streaming);
        assert!(config.channels.is_empty());
        assert_eq!(config.heartbeat.interval_minutes, 30);
    }

    #[test]
    fn enabled_channels_sorted() {
        let json = r#"{
            "channels": {
                "telegram": {"enabled": true, "token": "t"},
                "feishu": {"enabled": true, "app_id": "a"},
                "qq": {"enabled": false}
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.enabled_channels(), vec!["feishu", "telegram"]);
    }

    #[test]
    fn channel_section_extra_fields() {
        let json = r#"{"enabled": true, "allow_from": ["u1|u2"], "token": "abc"}"#;
        let section: ChannelSection = serde_json::from_str(json).unwrap();
        assert!(section.enabled);
        assert_eq!(section.allow_from, vec!["u1|u2"]);
        assert_eq!(section.str_field("token"), Some("abc"));
        assert_eq!(section.str_field("missing"), None);
    }

    #[test]
    fn agent_mode_serde() {
        assert_eq!(
            serde_json::from_str::<AgentMode>("\"stdio\"").unwrap(),
            AgentMode::Stdio
        );
        assert_eq!(
            serde_json::from_str::<AgentMode>("\"ws\"").unwrap(),
            AgentMode::Ws
        );
        assert_eq!(
            serde_json::from_str::<AgentMode>("\"cli\"").unwrap(),
            AgentMode::Cli
        );
    }

    #[test]
    fn workspace_tilde_expansion() {
        let config: Config = serde_json::from_str(
            r#"{"agent": {"workspace": "~/bots/ws"}}"#,
        )
        .unwrap();
        let ws = config.workspace();
        assert!(ws.ends_with("bots/ws"));
        assert!(!ws.to_string_lossy().contains('~'));
    }

    #[test]
    fn workspace_defaults_under_data_dir() {
        let config = Config::default();
        assert!(config.workspace().ends_with(".spanbot/workspace"));
    }
}
