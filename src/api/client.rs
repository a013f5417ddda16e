//! REST client for the DTalks chat backend
//!
//! Persistence and fan-out live on the backend: sending a message, a typing
//! flag or a presence change is a plain HTTP request, and the backend
//! publishes the resulting event on the broker. Failures come back to the
//! caller as [`ChatError::DownstreamSend`]; the realtime link is unaffected.

use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{
    Message, OutgoingMessage, PresenceUpdate, TokenResponse, TypingUpdate,
};
use crate::transport::TokenProvider;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest file accepted for upload
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Default page size for history requests
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Chat backend client configuration
#[derive(Debug, Clone)]
pub struct ChatApiConfig {
    pub base_url: String,
    /// Bearer token of the logged-in user
    pub access_token: String,
    pub timeout: Duration,
}

impl ChatApiConfig {
    /// Build from the client configuration, resolving the access token from
    /// its environment variable
    pub fn from_client_config(config: &ClientConfig) -> ChatResult<Self> {
        Ok(Self {
            base_url: config.api.base_url.clone(),
            access_token: config.access_token()?,
            timeout: config.request_timeout(),
        })
    }
}

/// File attachment for [`ChatApi::send_file_message`]
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Optional caption stored as the message content
    pub caption: Option<String>,
    pub reply_to: Option<String>,
}

/// HTTP collaborator for token issuance, sends and history
#[derive(Debug, Clone)]
pub struct ChatApi {
    config: ChatApiConfig,
    client: Client,
}

impl ChatApi {
    pub fn new(config: ChatApiConfig) -> ChatResult<Self> {
        if config.access_token.is_empty() {
            return Err(ChatError::invalid_input("access token is required"));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChatError::invalid_input(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// `POST /messages` with a JSON body; returns the stored message
    pub async fn send_message(&self, message: &OutgoingMessage) -> ChatResult<Message> {
        if message.content.trim().is_empty() {
            return Err(ChatError::invalid_input("message content is empty"));
        }

        let request = self.client.post(self.url("/messages")).json(message);
        let stored: Message = self.send_json(request, "send message").await?;
        debug!(chat_id = %message.chat_id, message_id = %stored.id, "Message sent");
        Ok(stored)
    }

    /// `POST /messages` as multipart with the file attached
    pub async fn send_file_message(
        &self,
        chat_id: &str,
        upload: FileUpload,
    ) -> ChatResult<Message> {
        if upload.bytes.len() > MAX_FILE_SIZE {
            return Err(ChatError::invalid_input(format!(
                "file '{}' is {} bytes; maximum is 10MB",
                upload.file_name,
                upload.bytes.len()
            )));
        }
        if upload.file_name.is_empty() {
            return Err(ChatError::invalid_input("file name is required"));
        }

        let size = upload.bytes.len();
        let part = Part::bytes(upload.bytes).file_name(upload.file_name.clone());
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("message_type", "file")
            .part("file", part);
        if let Some(caption) = upload.caption.filter(|c| !c.trim().is_empty()) {
            form = form.text("content", caption);
        }
        if let Some(reply_to) = upload.reply_to {
            form = form.text("reply_to", reply_to);
        }

        let request = self.client.post(self.url("/messages")).multipart(form);
        let stored: Message = self.send_json(request, "send file").await?;
        debug!(chat_id, file = %upload.file_name, size, "File message sent");
        Ok(stored)
    }

    /// `POST /typing`
    pub async fn send_typing(&self, update: &TypingUpdate) -> ChatResult<()> {
        let request = self.client.post(self.url("/typing")).json(update);
        self.send(request, "send typing indicator").await.map(drop)
    }

    /// `POST /online-status`
    pub async fn update_online_status(&self, update: &PresenceUpdate) -> ChatResult<()> {
        let request = self.client.post(self.url("/online-status")).json(update);
        self.send(request, "update online status").await.map(drop)
    }

    /// `GET /chats/{id}/messages`, oldest first
    pub async fn chat_messages(
        &self,
        chat_id: &str,
        page: u32,
        limit: u32,
    ) -> ChatResult<Vec<Message>> {
        let request = self
            .client
            .get(self.url(&format!("/chats/{chat_id}/messages")))
            .query(&[("page", page.max(1)), ("limit", limit)]);
        self.send_json(request, "load history").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> ChatResult<Response> {
        let response = request
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| {
                warn!(action, is_timeout = e.is_timeout(), is_connect = e.is_connect(), "Request failed");
                ChatError::downstream_send(format!("{action}: {e}"), None)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(action, status = status.as_u16(), "Backend rejected request");
            return Err(ChatError::downstream_send(
                format!("{action}: {status} - {body}"),
                Some(status.as_u16()),
            ));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> ChatResult<T> {
        let response = self.send(request, action).await?;
        let status = response.status().as_u16();
        response.json().await.map_err(|e| {
            ChatError::downstream_send(format!("{action}: invalid response body: {e}"), Some(status))
        })
    }
}

#[async_trait]
impl TokenProvider for ChatApi {
    /// `GET /centrifugo/token`
    async fn fetch_token(&self) -> ChatResult<String> {
        let response = self
            .client
            .get(self.url("/centrifugo/token"))
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| ChatError::token_fetch(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::token_fetch(format!("backend returned {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ChatError::token_fetch(format!("invalid token response: {e}")))?;
        if body.token.is_empty() {
            return Err(ChatError::token_fetch("backend returned an empty token"));
        }
        Ok(body.token)
    }
}
