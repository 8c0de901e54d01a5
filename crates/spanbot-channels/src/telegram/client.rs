//! HTTP client wrapper for the Telegram Bot API.

use reqwest::Client;
use tracing::{debug, trace};

use spanbot_types::error::ChannelError;

use super::types::{
    EditMessageTextRequest, Message, SendMessageRequest, TelegramResponse, Update, User,
};

/// Typed client for the Bot API methods the connector needs.
pub struct TelegramClient {
    http: Client,
    /// Base URL: `https://api.telegram.org/bot{token}` by default.
    base_url: String,
}

impl TelegramClient {
    /// Create a new client with the given bot token.
    pub fn new(token: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
        }
    }

    /// Create a client pointing at a custom base URL (for testing).
    #[cfg(test)]
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }

    fn unwrap_response<T>(
        body: TelegramResponse<T>,
        err: fn(String) -> ChannelError,
    ) -> Result<T, ChannelError> {
        if !body.ok {
            let desc = body.description.unwrap_or_else(|| "unknown error".into());
            return Err(err(desc));
        }
        body.result
            .ok_or_else(|| err("missing result in response".into()))
    }

    /// Verify the bot token via `getMe`.
    pub async fn get_me(&self) -> Result<User, ChannelError> {
        let url = format!("{}/getMe", self.base_url);
        debug!("verifying bot token");

        let body: TelegramResponse<User> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::AuthFailed(e.to_string()))?;

        Self::unwrap_response(body, ChannelError::AuthFailed)
    }

    /// Fetch new updates with long polling.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, ChannelError> {
        let mut url = format!("{}/getUpdates?timeout={timeout_secs}", self.base_url);
        if let Some(off) = offset {
            url.push_str(&format!("&offset={off}"));
        }
        trace!(url = %url, "polling for updates");

        let body: TelegramResponse<Vec<Update>> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::ReceiveFailed(e.to_string()))?;

        if !body.ok {
            let desc = body.description.unwrap_or_else(|| "unknown error".into());
            return Err(ChannelError::ReceiveFailed(desc));
        }
        Ok(body.result.unwrap_or_default())
    }

    /// Send a text message.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<Message, ChannelError> {
        let url = format!("{}/sendMessage", self.base_url);
        let req = SendMessageRequest {
            chat_id,
            text: text.to_owned(),
            reply_to_message_id: reply_to,
        };
        debug!(chat_id, "sending message");

        let body: TelegramResponse<Message> = self
            .http
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        Self::unwrap_response(body, ChannelError::SendFailed)
    }

    /// Replace the text of an existing message.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), ChannelError> {
        let url = format!("{}/editMessageText", self.base_url);
        let req = EditMessageTextRequest {
            chat_id,
            message_id,
            text: text.to_owned(),
        };

        let body: TelegramResponse<serde_json::Value> = self
            .http
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !body.ok {
            let desc = body.description.unwrap_or_else(|| "unknown error".into());
            return Err(ChannelError::SendFailed(desc));
        }
        Ok(())
    }

    /// Upload a local file as a document.
    pub async fn send_document(&self, chat_id: i64, path: &str) -> Result<(), ChannelError> {
        let url = format!("{}/sendDocument", self.base_url);

        let file = tokio::fs::read(path)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("read {path}: {e}")))?;
        let filename = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".into());

        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(file).file_name(filename),
            );

        let body: TelegramResponse<serde_json::Value> = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !body.ok {
            let desc = body.description.unwrap_or_else(|| "unknown error".into());
            return Err(ChannelError::SendFailed(desc));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_message_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sendMessage")
            .with_body(
                r#"{"ok": true, "result": {"message_id": 11, "chat": {"id": 5, "type": "private"}}}"#,
            )
            .create_async()
            .await;

        let client = TelegramClient::with_base_url(server.url());
        let sent = client.send_message(5, "hi", None).await.unwrap();
        assert_eq!(sent.message_id, 11);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_message_failure_maps_description() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sendMessage")
            .with_body(r#"{"ok": false, "description": "chat not found"}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_base_url(server.url());
        let err = client.send_message(5, "hi", None).await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn get_updates_parses_list() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex(r"^/getUpdates.*".into()))
            .with_body(
                r#"{"ok": true, "result": [
                    {"update_id": 1, "message": {"message_id": 2,
                     "chat": {"id": 3, "type": "private"}, "text": "yo"}}
                ]}"#,
            )
            .create_async()
            .await;

        let client = TelegramClient::with_base_url(server.url());
        let updates = client.get_updates(Some(1), 0).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].message.as_ref().unwrap().text.as_deref(), Some("yo"));
    }

    #[tokio::test]
    async fn edit_message_text_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/editMessageText")
            .with_body(r#"{"ok": true, "result": true}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_base_url(server.url());
        assert!(client.edit_message_text(5, 11, "longer text").await.is_ok());
    }
}
