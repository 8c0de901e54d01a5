//! HTTP client for the QQ bot OpenAPI.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use spanbot_types::error::ChannelError;

/// Refresh the cached token this long before its reported expiry.
const TOKEN_EARLY_REFRESH: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Typed client for the QQ bot OpenAPI endpoints the connector needs.
pub struct QqApiClient {
    http: Client,
    app_id: String,
    client_secret: String,
    auth_url: String,
    api_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl QqApiClient {
    /// Create a client for the given bot credentials.
    pub fn new(app_id: &str, client_secret: &str) -> Self {
        Self::with_urls(
            app_id,
            client_secret,
            "https://bots.qq.com".into(),
            "https://api.sgroup.qq.com".into(),
        )
    }

    /// Create a client against custom endpoints (for testing).
    pub fn with_urls(app_id: &str, client_secret: &str, auth_url: String, api_url: String) -> Self {
        Self {
            http: Client::new(),
            app_id: app_id.to_owned(),
            client_secret: client_secret.to_owned(),
            auth_url,
            api_url,
            token: Mutex::new(None),
        }
    }

    /// Fetch or reuse the app access token.
    pub async fn access_token(&self) -> Result<String, ChannelError> {
        {
            let cached = self.token.lock().await;
            if let Some(token) = cached.as_ref()
                && Instant::now() < token.expires_at
            {
                return Ok(token.token.clone());
            }
        }

        let url = format!("{}/app/getAppAccessToken", self.auth_url);
        let body: Value = self
            .http
            .post(&url)
            .json(&json!({"appId": self.app_id, "clientSecret": self.client_secret}))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::AuthFailed(e.to_string()))?;

        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChannelError::AuthFailed("missing access_token".into()))?
            .to_owned();
        let expires: u64 = body
            .get("expires_in")
            .and_then(|e| e.as_str().and_then(|s| s.parse().ok()).or(e.as_u64()))
            .unwrap_or(7200);

        let expires_at =
            Instant::now() + Duration::from_secs(expires).saturating_sub(TOKEN_EARLY_REFRESH);
        *self.token.lock().await = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        debug!(expires, "qq access token refreshed");
        Ok(token)
    }

    /// Resolve the gateway WebSocket URL.
    pub async fn gateway_url(&self) -> Result<String, ChannelError> {
        let token = self.access_token().await?;
        let body: Value = self
            .http
            .get(format!("{}/gateway", self.api_url))
            .header("Authorization", format!("QQBot {token}"))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        body.get("url")
            .and_then(|u| u.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::ConnectionFailed("gateway response missing url".into()))
    }

    /// Send one C2C text message as a passive reply.
    ///
    /// `msg_id` is the inbound message being answered; `msg_seq`
    /// distinguishes multiple replies to the same inbound message.
    pub async fn send_c2c_message(
        &self,
        openid: &str,
        content: &str,
        msg_id: Option<&str>,
        msg_seq: u32,
    ) -> Result<(), ChannelError> {
        let token = self.access_token().await?;
        let url = format!("{}/v2/users/{openid}/messages", self.api_url);

        let mut body = json!({
            "content": content,
            "msg_type": 0,
            "msg_seq": msg_seq,
        });
        if let Some(msg_id) = msg_id {
            body["msg_id"] = json!(msg_id);
        }

        let response: Value = self
            .http
            .post(&url)
            .header("Authorization", format!("QQBot {token}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if let Some(code) = response.get("code").and_then(|c| c.as_i64())
            && code != 0
        {
            let msg = response.get("message").and_then(|m| m.as_str()).unwrap_or("unknown");
            return Err(ChannelError::SendFailed(format!("qq api: code={code} msg={msg}")));
        }
        Ok(())
    }
}
