//! `spanbot gateway` -- gateway lifecycle.
//!
//! `run` is the foreground coordinator: it owns the bus, session store,
//! agent transport + adapter, agent loop, channel manager, scheduler,
//! and heartbeat, and tears everything down on Ctrl+C. `start` detaches
//! a `gateway run` child (guarded by the PID file), `stop` signals the
//! recorded PID, and `restart` chains the two.
//!
//! # Lifecycle
//!
//! ```text
//! 1. Load config, resolve workspace, open stores
//! 2. Build the transport (stdio / ws / cli) and connect the adapter
//! 3. Start channels via the manager; register card-edit streams
//! 4. Spawn the agent loop, scheduler, and heartbeat
//! 5. Wait for Ctrl+C, then cancel, stop channels, stop the transport
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spanbot_agent::adapter::{AdapterConfig, AgentAdapter};
use spanbot_agent::history::default_sessions_dir;
use spanbot_agent::session::SessionStore;
use spanbot_agent::transport::cli::CliTransport;
use spanbot_agent::transport::stdio::StdioTransport;
use spanbot_agent::transport::ws::WsTransport;
use spanbot_agent::transport::AgentTransport;
use spanbot_channels::{ChannelManager, builtin_factories};
use spanbot_core::agent_loop::{AgentLoop, LoopConfig};
use spanbot_core::recorder::ChannelRecorder;
use spanbot_core::MessageBus;
use spanbot_services::cron::{CronService, DeliverFn, JobHandler};
use spanbot_services::error::ServiceError;
use spanbot_services::heartbeat::{HeartbeatFn, HeartbeatService, NotifyFn};
use spanbot_types::config::{AgentMode, Config};
use spanbot_types::event::OutboundMessage;

use super::{
    config_path, cron_store_path, load_config, pid_path, process_running, read_pid, recorder_dir,
    session_map_path,
};

/// Gateway lifecycle actions.
#[derive(Subcommand)]
pub enum GatewayAction {
    /// Start the gateway as a detached background process.
    Start,
    /// Run the gateway in the foreground.
    Run,
    /// Stop a running gateway.
    Stop,
    /// Stop then start the gateway.
    Restart,
}

/// Dispatch a gateway action.
pub async fn run(action: GatewayAction, config_override: Option<&str>) -> anyhow::Result<()> {
    match action {
        GatewayAction::Run => run_foreground(config_override).await,
        GatewayAction::Start => start_detached(config_override),
        GatewayAction::Stop => stop(),
        GatewayAction::Restart => {
            let _ = stop();
            tokio::time::sleep(Duration::from_millis(500)).await;
            start_detached(config_override)
        }
    }
}

fn guard_double_start() -> anyhow::Result<()> {
    if let Some(pid) = read_pid() {
        if process_running(pid) {
            bail!("gateway already running (pid {pid}); use `spanbot gateway stop` first");
        }
        let _ = std::fs::remove_file(pid_path());
    }
    Ok(())
}

fn start_detached(config_override: Option<&str>) -> anyhow::Result<()> {
    guard_double_start()?;

    let exe = std::env::current_exe().context("failed to resolve the spanbot binary")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.args(["gateway", "run"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(config) = config_override {
        cmd.args(["--config", config]);
    }

    let child = cmd.spawn().context("failed to spawn gateway process")?;
    println!("gateway started (pid {})", child.id());
    Ok(())
}

fn stop() -> anyhow::Result<()> {
    let Some(pid) = read_pid() else {
        bail!("no gateway PID file found; is the gateway running?");
    };
    if !process_running(pid) {
        let _ = std::fs::remove_file(pid_path());
        bail!("recorded gateway (pid {pid}) is not running; removed stale PID file");
    }

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg(pid.to_string())
            .status()
            .context("failed to signal gateway process")?;
        if !status.success() {
            bail!("failed to stop gateway (pid {pid})");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("gateway stop is only supported on unix hosts");
    }

    println!("gateway stopped (pid {pid})");
    Ok(())
}

fn build_transport(config: &Config) -> Arc<dyn AgentTransport> {
    let timeout = Duration::from_secs(config.agent.timeout_secs);
    let workspace = config.workspace();

    match config.agent.mode {
        AgentMode::Stdio => Arc::new(StdioTransport::new(
            config.agent.iflow_path.clone(),
            workspace,
            timeout,
        )),
        AgentMode::Ws => Arc::new(WsTransport::new(
            &config.agent.acp_host,
            config.agent.acp_port,
            timeout,
        )),
        AgentMode::Cli => Arc::new(CliTransport::new(
            config.agent.iflow_path.clone(),
            workspace,
            config.agent.model.clone(),
            config.agent.thinking,
        )),
    }
}

async fn run_foreground(config_override: Option<&str>) -> anyhow::Result<()> {
    guard_double_start()?;

    let config = load_config(config_override)?;
    info!(path = %config_path(config_override).display(), "gateway starting");

    let workspace = config.workspace();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;

    // ── Bus + recorder ──────────────────────────────────────────────
    let mut bus = MessageBus::with_capacity(config.gateway.bus_capacity);
    if config.gateway.record_messages {
        bus = bus.with_recorder(Arc::new(ChannelRecorder::new(recorder_dir())));
    }
    let bus = Arc::new(bus);

    // ── Agent adapter ───────────────────────────────────────────────
    let sessions = Arc::new(SessionStore::open(session_map_path()));
    let transport = build_transport(&config);
    let adapter = Arc::new(AgentAdapter::new(
        transport,
        sessions,
        AdapterConfig {
            workspace: workspace.clone(),
            model: config.agent.model.clone(),
            timeout: Duration::from_secs(config.agent.timeout_secs),
            thinking: config.agent.thinking,
            sessions_dir: config
                .agent
                .sessions_dir
                .as_ref()
                .map(std::path::PathBuf::from)
                .unwrap_or_else(default_sessions_dir),
        },
    ));
    adapter.connect().await.context("failed to connect to the agent")?;
    info!(mode = ?config.agent.mode, "agent adapter connected");

    // ── Agent loop ──────────────────────────────────────────────────
    let loop_config = LoopConfig {
        workspace: workspace.clone(),
        streaming: config.gateway.streaming,
        streaming_channels: config.gateway.streaming_channels.iter().cloned().collect(),
        line_split_threshold: config.gateway.line_split_threshold,
        ..LoopConfig::default()
    };
    let agent_loop = Arc::new(AgentLoop::new(bus.clone(), adapter.clone(), loop_config));

    // ── Channels ────────────────────────────────────────────────────
    let manager = Arc::new(ChannelManager::new(bus.clone(), builtin_factories()));
    let started = manager.start_all(&config).await;
    if started == 0 && !config.enabled_channels().is_empty() {
        bail!("no channels started successfully");
    }
    info!(channels = started, "channels running");

    // Card-edit connectors stream through the loop directly.
    for name in manager.active().await {
        if let Some(channel) = manager.get(&name).await
            && let Some(card) = channel.card_stream()
        {
            agent_loop.register_card_stream(&name, card).await;
        }
    }

    let cancel = CancellationToken::new();

    let loop_handle = {
        let agent_loop = agent_loop.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agent_loop.run(cancel).await })
    };

    // ── Scheduler ───────────────────────────────────────────────────
    let on_job: JobHandler = {
        let agent_loop = agent_loop.clone();
        Arc::new(move |job| {
            let agent_loop = agent_loop.clone();
            Box::pin(async move {
                agent_loop
                    .process_direct(&job.payload.message, Some(&format!("cron:{}", job.id)))
                    .await
                    .map_err(|e| ServiceError::Execution(e.to_string()))
            })
        })
    };
    let on_deliver: DeliverFn = {
        let bus = bus.clone();
        Arc::new(move |msg| bus.publish_outbound(msg))
    };

    let cron_handle = match CronService::new(cron_store_path(), on_job, Some(on_deliver)).await {
        Ok(service) => {
            let service = Arc::new(service);
            let cancel = cancel.clone();
            info!("cron service initialized");
            Some(tokio::spawn(async move { service.start(cancel).await }))
        }
        Err(e) => {
            warn!(error = %e, "failed to initialize cron service, skipping");
            None
        }
    };

    // ── Heartbeat ───────────────────────────────────────────────────
    let heartbeat_handle = if config.heartbeat.enabled && config.heartbeat.interval_minutes > 0 {
        let on_heartbeat: HeartbeatFn = {
            let agent_loop = agent_loop.clone();
            Arc::new(move |prompt| {
                let agent_loop = agent_loop.clone();
                Box::pin(async move {
                    agent_loop
                        .process_direct(&prompt, Some("heartbeat"))
                        .await
                        .map_err(|e| ServiceError::Execution(e.to_string()))
                })
            })
        };
        let on_notify: Option<NotifyFn> = match (
            config.heartbeat.notify_channel.clone(),
            config.heartbeat.notify_to.clone(),
        ) {
            (Some(channel), Some(to)) => {
                let bus = bus.clone();
                Some(Arc::new(move |response: String| {
                    let bus = bus.clone();
                    let channel = channel.clone();
                    let to = to.clone();
                    Box::pin(async move {
                        bus.publish_outbound(OutboundMessage::new(channel, to, response));
                    })
                }))
            }
            _ => None,
        };

        let service = HeartbeatService::new(
            workspace.clone(),
            Duration::from_secs(config.heartbeat.interval_minutes * 60),
            on_heartbeat,
            on_notify,
        );
        let cancel = cancel.clone();
        info!(
            interval_minutes = config.heartbeat.interval_minutes,
            "heartbeat service started"
        );
        Some(tokio::spawn(async move { service.start(cancel).await }))
    } else {
        None
    };

    // ── PID file + shutdown ─────────────────────────────────────────
    if let Some(parent) = pid_path().parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path(), std::process::id().to_string())?;
    info!(pid = std::process::id(), "gateway running -- press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    cancel.cancel();
    manager.stop_all().await;
    bus.stop();
    adapter.disconnect().await;

    if let Some(handle) = cron_handle {
        let _ = handle.await;
    }
    if let Some(handle) = heartbeat_handle {
        let _ = handle.await;
    }
    let _ = loop_handle.await;

    let _ = std::fs::remove_file(pid_path());
    info!("gateway shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_selection_follows_mode() {
        let mut config = Config::default();

        config.agent.mode = AgentMode::Stdio;
        let _stdio = build_transport(&config);

        config.agent.mode = AgentMode::Ws;
        let _ws = build_transport(&config);

        config.agent.mode = AgentMode::Cli;
        let _cli = build_transport(&config);
    }
}
