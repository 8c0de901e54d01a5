//! One-shot CLI transport.
//!
//! Spawns the agent binary once per turn with `-p <message>`, reads its
//! stdout as the response body, and recovers the session id from the
//! combined output. There is no wire session management: `create_session`
//! returns an empty binding and the adapter rebinds from the id the
//! process prints. Progress markers and execution-info blocks are
//! stripped from the response before it reaches the user.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use spanbot_types::error::AgentError;

use super::{
    AgentCapabilities, AgentTransport, PromptOutcome, SessionOptions, StopReason, UpdateHandler,
};

static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""session-id"\s*:\s*"(session-[^"]+)""#).unwrap());

/// Spawn-per-turn transport over the agent's plain CLI.
pub struct CliTransport {
    iflow_path: String,
    workspace: PathBuf,
    model: String,
    thinking: bool,
}

impl CliTransport {
    /// Create a CLI transport running `iflow_path` in `workspace`.
    pub fn new(iflow_path: String, workspace: PathBuf, model: String, thinking: bool) -> Self {
        Self {
            iflow_path,
            workspace,
            model,
            thinking,
        }
    }

    fn build_args(&self, session_id: &str, message: &str) -> Vec<String> {
        let mut args = vec!["-m".to_owned(), self.model.clone()];
        if !session_id.is_empty() {
            args.push("-r".to_owned());
            args.push(session_id.to_owned());
        }
        args.push("-y".to_owned());
        if self.thinking {
            args.push("--thinking".to_owned());
        }
        args.push("-p".to_owned());
        args.push(message.to_owned());
        args
    }

    async fn run_process(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<(String, String), AgentError> {
        debug!(path = %self.iflow_path, "running agent CLI");

        let mut child = Command::new(&self.iflow_path)
            .args(args)
            .current_dir(&self.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Process(format!("failed to spawn {}: {e}", self.iflow_path))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Process("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Process("child stderr unavailable".into()))?;

        let gather = async {
            let mut out_lines = Vec::new();
            let mut err_lines = Vec::new();
            let mut out_reader = BufReader::new(stdout).lines();
            let mut err_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = out_reader.next_line() => match line {
                        Ok(Some(l)) => out_lines.push(l),
                        Ok(None) => break,
                        Err(e) => return Err(AgentError::Process(e.to_string())),
                    },
                    line = err_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            err_lines.push(l);
                        }
                    }
                }
            }
            // Drain any remaining stderr after stdout closed.
            while let Ok(Some(l)) = err_reader.next_line().await {
                err_lines.push(l);
            }
            Ok((out_lines.join("\n"), err_lines.join("\n")))
        };

        let output = match tokio::time::timeout(timeout, gather).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(AgentError::Timeout {
                    operation: "iflow cli".into(),
                });
            }
        };

        let _ = child.wait().await;
        Ok(output)
    }
}

#[async_trait]
impl AgentTransport for CliTransport {
    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn initialize(&self) -> Result<AgentCapabilities, AgentError> {
        Ok(serde_json::Value::Null)
    }

    async fn authenticate(&self, _method_id: &str) -> Result<bool, AgentError> {
        Ok(true)
    }

    async fn create_session(&self, _opts: &SessionOptions) -> Result<String, AgentError> {
        // No wire call exists; the first prompt implicitly creates the
        // session and its id is recovered from the process output.
        Ok(String::new())
    }

    async fn load_session(&self, _session_id: &str, _cwd: &Path) -> Result<bool, AgentError> {
        Ok(true)
    }

    async fn prompt(
        &self,
        session_id: &str,
        text: &str,
        _on_update: Option<UpdateHandler>,
        timeout: Duration,
    ) -> Result<PromptOutcome, AgentError> {
        let args = self.build_args(session_id, text);
        let (stdout, stderr) = self.run_process(&args, timeout).await?;

        let combined = format!("{stdout}\n{stderr}");
        let recovered = extract_session_id(&combined);
        if let Some(id) = &recovered {
            info!(session = %id, "recovered session id from CLI output");
        }

        Ok(PromptOutcome {
            content: filter_progress_output(stdout.trim()),
            stop_reason: StopReason::EndTurn,
            session_id: recovered,
            ..PromptOutcome::default()
        })
    }

    async fn cancel(&self, _session_id: &str) {}

    async fn stop(&self) {}
}

/// Recover a `session-...` id from the agent's output.
pub fn extract_session_id(output: &str) -> Option<String> {
    SESSION_ID_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Strip progress noise from CLI output: execution-info blocks, thinking
/// markers, bracket-only status lines, and resume notices.
pub fn filter_progress_output(output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }

    let mut filtered = Vec::new();
    let mut in_execution_info = false;

    for line in output.lines() {
        let stripped = line.trim();

        if stripped.starts_with("<Execution Info>") || stripped.starts_with("〈Execution Info〉") {
            in_execution_info = true;
            continue;
        }
        if stripped.starts_with("</Execution Info>") || stripped.starts_with("〈/Execution Info〉")
        {
            in_execution_info = false;
            continue;
        }
        if in_execution_info {
            continue;
        }

        if matches!(stripped, "Thinking..." | "正在思考..." | "Processing...") {
            continue;
        }
        if stripped.starts_with('[') && stripped.ends_with(']') {
            continue;
        }
        if stripped.starts_with("ℹ️") && stripped.contains("Resuming session") {
            continue;
        }

        filtered.push(line);
    }

    filtered.join("\n").trim().to_owned()
}
