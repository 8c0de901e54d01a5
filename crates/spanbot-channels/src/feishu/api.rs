//! HTTP client for the Feishu open platform.
//!
//! Covers tenant access tokens (cached with TTL, refreshed 60 seconds
//! before expiry), message and media APIs, the card entity APIs used for
//! streaming updates, and the long-connection endpoint handshake.

use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use spanbot_types::error::ChannelError;

/// Refresh the cached token this long before its reported expiry.
const TOKEN_EARLY_REFRESH: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Typed client for the Feishu open-platform APIs the connector needs.
pub struct FeishuClient {
    http: Client,
    app_id: String,
    app_secret: String,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl FeishuClient {
    /// Create a client for the given app credentials.
    pub fn new(app_id: &str, app_secret: &str) -> Self {
        Self::with_base_url(app_id, app_secret, "https://open.feishu.cn".into())
    }

    /// Create a client against a custom base URL (for testing).
    pub fn with_base_url(app_id: &str, app_secret: &str, base_url: String) -> Self {
        Self {
            http: Client::new(),
            app_id: app_id.to_owned(),
            app_secret: app_secret.to_owned(),
            base_url,
            token: Mutex::new(None),
        }
    }

    /// Drop the cached token so the next call fetches a fresh one.
    pub async fn invalidate_token(&self) {
        *self.token.lock().await = None;
        debug!("feishu access token invalidated");
    }

    /// Fetch or reuse the tenant access token.
    pub async fn tenant_access_token(&self) -> Result<String, ChannelError> {
        {
            let cached = self.token.lock().await;
            if let Some(token) = cached.as_ref()
                && Instant::now() < token.expires_at
            {
                return Ok(token.token.clone());
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let body: Value = self
            .http
            .post(&url)
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::AuthFailed(e.to_string()))?;

        if body.get("code").and_then(|c| c.as_i64()).unwrap_or(-1) != 0 {
            let msg = body.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown");
            return Err(ChannelError::AuthFailed(format!("token request: {msg}")));
        }

        let token = body
            .get("tenant_access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChannelError::AuthFailed("missing tenant_access_token".into()))?
            .to_owned();
        let expire = body.get("expire").and_then(|e| e.as_u64()).unwrap_or(7200);

        let expires_at =
            Instant::now() + Duration::from_secs(expire).saturating_sub(TOKEN_EARLY_REFRESH);
        *self.token.lock().await = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        debug!(expire, "feishu access token refreshed");
        Ok(token)
    }

    /// Authenticated request returning the `data` object of the envelope.
    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Value,
    ) -> Result<Value, ChannelError> {
        let token = self.tenant_access_token().await?;
        let url = format!("{}{path}", self.base_url);

        let response: Value = self
            .http
            .request(method, &url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        let code = response.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
        if code != 0 {
            let msg = response.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown");
            return Err(ChannelError::SendFailed(format!("feishu api {path}: code={code} msg={msg}")));
        }
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Send a message; returns the created message id when present.
    pub async fn send_message(
        &self,
        receive_id_type: &str,
        receive_id: &str,
        msg_type: &str,
        content: &str,
    ) -> Result<Option<String>, ChannelError> {
        let data = self
            .call(
                reqwest::Method::POST,
                &format!("/open-apis/im/v1/messages?receive_id_type={receive_id_type}"),
                json!({
                    "receive_id": receive_id,
                    "msg_type": msg_type,
                    "content": content,
                }),
            )
            .await?;

        Ok(data
            .get("message_id")
            .and_then(|m| m.as_str())
            .map(str::to_owned))
    }

    /// Create a card entity with streaming mode enabled.
    ///
    /// The card carries a single markdown element (`element_id`) that the
    /// streaming updates rewrite.
    pub async fn create_card(&self, element_id: &str) -> Result<String, ChannelError> {
        let card = json!({
            "schema": "2.0",
            "config": {
                "streaming_mode": true,
                "summary": {"content": "..."},
            },
            "body": {
                "elements": [
                    {"tag": "markdown", "content": "", "element_id": element_id}
                ],
            },
        });

        let data = self
            .call(
                reqwest::Method::POST,
                "/open-apis/cardkit/v1/cards",
                json!({
                    "type": "card_json",
                    "data": card.to_string(),
                }),
            )
            .await?;

        data.get("card_id")
            .and_then(|c| c.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::SendFailed("missing card_id in response".into()))
    }

    /// Push the cumulative content into a card's streaming element.
    pub async fn update_card_element(
        &self,
        card_id: &str,
        element_id: &str,
        content: &str,
        sequence: i64,
    ) -> Result<(), ChannelError> {
        self.call(
            reqwest::Method::PUT,
            &format!("/open-apis/cardkit/v1/cards/{card_id}/elements/{element_id}/content"),
            json!({"content": content, "sequence": sequence}),
        )
        .await?;
        Ok(())
    }

    /// Turn off streaming mode, marking the card as final.
    pub async fn finalize_card(&self, card_id: &str, sequence: i64) -> Result<(), ChannelError> {
        self.call(
            reqwest::Method::PUT,
            &format!("/open-apis/cardkit/v1/cards/{card_id}/settings"),
            json!({
                "settings": json!({"config": {"streaming_mode": false}}).to_string(),
                "sequence": sequence,
            }),
        )
        .await?;
        Ok(())
    }

    /// Send a card entity as an interactive message.
    pub async fn send_card(
        &self,
        receive_id_type: &str,
        receive_id: &str,
        card_id: &str,
    ) -> Result<Option<String>, ChannelError> {
        let content = json!({"type": "card", "data": {"card_id": card_id}});
        self.send_message(receive_id_type, receive_id, "interactive", &content.to_string())
            .await
    }

    /// Upload a local image; returns the image key.
    pub async fn upload_image(&self, path: &str) -> Result<String, ChannelError> {
        let token = self.tenant_access_token().await?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("read {path}: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .text("image_type", "message")
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name(path)),
            );

        let response: Value = self
            .http
            .post(format!("{}/open-apis/im/v1/images", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        response
            .pointer("/data/image_key")
            .and_then(|k| k.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::SendFailed("image upload returned no key".into()))
    }

    /// Upload a local file; returns the file key.
    pub async fn upload_file(&self, path: &str) -> Result<String, ChannelError> {
        let token = self.tenant_access_token().await?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("read {path}: {e}")))?;

        let file_type = match Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("opus") => "opus",
            Some("mp4") => "mp4",
            Some("pdf") => "pdf",
            Some("doc") | Some("docx") => "doc",
            Some("xls") | Some("xlsx") => "xls",
            Some("ppt") | Some("pptx") => "ppt",
            _ => "stream",
        };

        let form = reqwest::multipart::Form::new()
            .text("file_type", file_type.to_owned())
            .text("file_name", file_name(path))
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name(path)),
            );

        let response: Value = self
            .http
            .post(format!("{}/open-apis/im/v1/files", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        response
            .pointer("/data/file_key")
            .and_then(|k| k.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ChannelError::SendFailed("file upload returned no key".into()))
    }

    /// Resolve the long-connection WebSocket URL.
    pub async fn ws_endpoint(&self) -> Result<String, ChannelError> {
        let url = format!("{}/callback/ws/endpoint", self.base_url);
        let response: Value = self
            .http
            .post(&url)
            .json(&json!({"AppID": self.app_id, "AppSecret": self.app_secret}))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        response
            .pointer("/data/URL")
            .or_else(|| response.get("URL"))
            .and_then(|u| u.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                warn!("ws endpoint response missing URL");
                ChannelError::ConnectionFailed("missing long-connection URL".into())
            })
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".into())
}
