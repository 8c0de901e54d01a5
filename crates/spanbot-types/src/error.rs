//! Error types for the spanbot gateway.
//!
//! [`SpanbotError`] is the top-level error type; [`ChannelError`] covers
//! connector failures and [`AgentError`] covers the agent transport and
//! adapter layer. All three are non-exhaustive to allow future extension
//! without breaking downstream.

use thiserror::Error;

/// Top-level error type for the spanbot gateway.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SpanbotError {
    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A bus-layer error (queue full, bus stopped).
    #[error("bus error: {0}")]
    Bus(String),

    /// A channel-layer error bubbled up.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// An agent-layer error bubbled up.
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Channel-specific error type.
///
/// Used by connector implementations (Telegram, Feishu, QQ, etc.) to
/// report failures in connecting, authenticating, or exchanging messages.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    /// Failed to establish a connection to the channel backend.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication / authorization was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Sending a message failed after retries were exhausted.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receiving a message failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The channel is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// The requested channel was not found.
    #[error("channel not found: {0}")]
    NotFound(String),

    /// Catch-all for errors that do not fit other variants.
    #[error("{0}")]
    Other(String),
}

/// Agent transport / adapter error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AgentError {
    /// The transport has not been started.
    #[error("agent transport not started")]
    NotStarted,

    /// A request exceeded its deadline.
    #[error("agent request timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// The connection to the agent process was lost; pending requests fail.
    #[error("agent connection lost: {0}")]
    ConnectionLost(String),

    /// The agent returned a JSON-RPC error.
    #[error("agent error: {0}")]
    Rpc(String),

    /// The agent reported a turn-level failure (`stop_reason = error`).
    #[error("chat error: {0}")]
    Chat(String),

    /// Spawning or driving the agent child process failed.
    #[error("agent process error: {0}")]
    Process(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether this error carries an "Invalid request"-class marker,
    /// meaning the bound session id is no longer valid on the agent side.
    pub fn is_session_invalid(&self) -> bool {
        match self {
            AgentError::Rpc(msg) | AgentError::Chat(msg) => msg.contains("Invalid request"),
            _ => false,
        }
    }
}

/// A convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SpanbotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spanbot_error_display() {
        let err = SpanbotError::ConfigInvalid {
            reason: "missing token".into(),
        };
        assert_eq!(err.to_string(), "invalid config: missing token");
    }

    #[test]
    fn spanbot_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SpanbotError = io_err.into();
        assert!(matches!(err, SpanbotError::Io(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn channel_error_display() {
        let err = ChannelError::NotConnected;
        assert_eq!(err.to_string(), "not connected");

        let err = ChannelError::AuthFailed("bad token".into());
        assert_eq!(err.to_string(), "authentication failed: bad token");
    }

    #[test]
    fn agent_error_display() {
        let err = AgentError::Timeout {
            operation: "session/prompt".into(),
        };
        assert_eq!(err.to_string(), "agent request timed out: session/prompt");
    }

    #[test]
    fn session_invalid_marker() {
        let err = AgentError::Rpc("Invalid request: session not found".into());
        assert!(err.is_session_invalid());

        let err = AgentError::Chat("Invalid request".into());
        assert!(err.is_session_invalid());

        let err = AgentError::Rpc("internal error".into());
        assert!(!err.is_session_invalid());

        let err = AgentError::NotStarted;
        assert!(!err.is_session_invalid());
    }

    #[test]
    fn errors_convert_to_top_level() {
        let err: SpanbotError = ChannelError::NotFound("mochat".into()).into();
        assert!(matches!(err, SpanbotError::Channel(_)));

        let err: SpanbotError = AgentError::NotStarted.into();
        assert!(matches!(err, SpanbotError::Agent(_)));
    }
}
