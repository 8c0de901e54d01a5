//! HTTP client for the Slack Web API.

use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use spanbot_types::error::ChannelError;

/// Typed client for the Slack Web API methods the connector needs.
pub struct SlackApiClient {
    http: Client,
    bot_token: String,
    base_url: String,
}

impl SlackApiClient {
    /// Create a client with the given bot token.
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(bot_token, "https://slack.com/api".into())
    }

    /// Create a client against a custom base URL (for testing).
    pub fn with_base_url(bot_token: &str, base_url: String) -> Self {
        Self {
            http: Client::new(),
            bot_token: bot_token.to_owned(),
            base_url,
        }
    }

    /// Open a Socket Mode connection; returns the WebSocket URL.
    ///
    /// Requires the app-level token, not the bot token.
    pub async fn apps_connections_open(&self, app_token: &str) -> Result<String, ChannelError> {
        let body: Value = self
            .http
            .post(format!("{}/apps.connections.open", self.base_url))
            .bearer_auth(app_token)
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        if !body.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
            let err = body.get("error").and_then(|e| e.as_str()).unwrap_or("unknown");
            return Err(ChannelError::AuthFailed(format!("apps.connections.open: {err}")));
        }

        body.get("url")
            .and_then(|u| u.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::ConnectionFailed("missing socket url".into()))
    }

    /// Post a message; returns the message timestamp.
    pub async fn chat_post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, ChannelError> {
        let mut body = json!({"channel": channel, "text": text});
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        debug!(channel, "posting slack message");

        let response: Value = self
            .http
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !response.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
            let err = response.get("error").and_then(|e| e.as_str()).unwrap_or("unknown");
            return Err(ChannelError::SendFailed(format!("chat.postMessage: {err}")));
        }

        Ok(response
            .get("ts")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connections_open_returns_url() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/apps.connections.open")
            .with_body(r#"{"ok": true, "url": "wss://socket.test/link"}"#)
            .create_async()
            .await;

        let client = SlackApiClient::with_base_url("xoxb-1", server.url());
        let url = client.apps_connections_open("xapp-1").await.unwrap();
        assert_eq!(url, "wss://socket.test/link");
    }

    #[tokio::test]
    async fn connections_open_error_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/apps.connections.open")
            .with_body(r#"{"ok": false, "error": "invalid_auth"}"#)
            .create_async()
            .await;

        let client = SlackApiClient::with_base_url("xoxb-1", server.url());
        let err = client.apps_connections_open("xapp-1").await.unwrap_err();
        assert!(err.to_string().contains("invalid_auth"));
    }

    #[tokio::test]
    async fn post_message_returns_ts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat.postMessage")
            .with_body(r#"{"ok": true, "ts": "123.456"}"#)
            .create_async()
            .await;

        let client = SlackApiClient::with_base_url("xoxb-1", server.url());
        let ts = client.chat_post_message("C1", "hi", None).await.unwrap();
        assert_eq!(ts, "123.456");
    }

    #[tokio::test]
    async fn post_message_error_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat.postMessage")
            .with_body(r#"{"ok": false, "error": "channel_not_found"}"#)
            .create_async()
            .await;

        let client = SlackApiClient::with_base_url("xoxb-1", server.url());
        let err = client.chat_post_message("C1", "hi", None).await.unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }
}
