// REST client for the chat backend (bearer-token authenticated)

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{ChatApi, SendRequest};
use crate::models::{PeerProfile, RawMessage};

#[derive(Debug, Deserialize)]
struct UserDetailsResponse {
    #[serde(default)]
    user: Option<PeerProfile>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    message: Option<RawMessage>,
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_peer(&self, peer_id: &str) -> Result<PeerProfile> {
        debug!("Fetching details for user {}", peer_id);
        let response: UserDetailsResponse = self
            .http
            .get(self.url(&format!("user/details/{}", peer_id)))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid user details response")?;

        response.user.ok_or_else(|| anyhow!("user {} not found", peer_id))
    }

    async fn fetch_history(&self, peer_id: &str) -> Result<Vec<RawMessage>> {
        debug!("Fetching chat history with {}", peer_id);
        let response: HistoryResponse = self
            .http
            .get(self.url(&format!("chat/history/{}", peer_id)))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid chat history response")?;

        info!("Fetched {} history messages with {}", response.messages.len(), peer_id);
        Ok(response.messages)
    }

    async fn send_message(&self, request: SendRequest) -> Result<RawMessage> {
        let builder = self.http.post(self.url("chat/send")).bearer_auth(&self.token);

        let builder = match request {
            SendRequest::Text {
                receiver_id,
                message,
                client_id,
            } => {
                debug!("Sending text message to {}", receiver_id);
                builder.json(&json!({
                    "receiver_id": receiver_id,
                    "type": "text",
                    "message": message,
                    "client_id": client_id,
                }))
            }
            SendRequest::Image {
                receiver_id,
                file_name,
                bytes,
                mime,
                client_id,
            } => {
                debug!("Sending image {} ({} bytes) to {}", file_name, bytes.len(), receiver_id);
                let file = Part::bytes(bytes)
                    .file_name(file_name.clone())
                    .mime_str(&mime)
                    .with_context(|| format!("invalid mime type '{}'", mime))?;
                let mut form = Form::new()
                    .text("receiver_id", receiver_id)
                    .text("type", "image")
                    .text("message", file_name)
                    .part("file", file);
                if let Some(client_id) = client_id {
                    form = form.text("client_id", client_id);
                }
                builder.multipart(form)
            }
        };

        let response: SendResponse = builder
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid send response")?;

        match response.message {
            Some(message) if message.id.is_some() => Ok(message),
            _ => Err(anyhow!("send response did not contain a stored message")),
        }
    }
}
