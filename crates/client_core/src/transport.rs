use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::PeerId,
    error::ApiError,
    protocol::{Message, OutgoingMessage, PeerSummary},
};
use tracing::debug;
use url::Url;

use crate::error::{ChatError, ConfigError};

/// Request/response side of the chat API.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// `GET /messages/{peerId}`: the full conversation, oldest first.
    async fn fetch_history(&self, peer_id: &PeerId) -> Result<Vec<Message>, ChatError>;
    /// `POST /messages/send/{peerId}`: the server's stored copy of the message.
    async fn send_message(
        &self,
        peer_id: &PeerId,
        payload: &OutgoingMessage,
    ) -> Result<Message, ChatError>;
    /// `GET /messages/users`.
    async fn list_peers(&self) -> Result<Vec<PeerSummary>, ChatError>;
}

pub struct HttpTransport {
    http: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(api_base_url: &str) -> Result<Self, ConfigError> {
        Self::with_client(Client::new(), api_base_url)
    }

    /// Uses a preconfigured client, e.g. one carrying session cookies.
    pub fn with_client(http: Client, api_base_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(api_base_url).map_err(|err| ConfigError::InvalidApiUrl {
            url: api_base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidApiUrl {
                url: api_base_url.to_string(),
                reason: "url cannot be a base".to_string(),
            });
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::transport("api base url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn fetch_history(&self, peer_id: &PeerId) -> Result<Vec<Message>, ChatError> {
        let url = self.endpoint(&["messages", peer_id.as_str()])?;
        let response = self.http.get(url).send().await?;
        read_json(response, "message history").await
    }

    async fn send_message(
        &self,
        peer_id: &PeerId,
        payload: &OutgoingMessage,
    ) -> Result<Message, ChatError> {
        let url = self.endpoint(&["messages", "send", peer_id.as_str()])?;
        let response = self.http.post(url).json(payload).send().await?;
        read_json(response, "sent message").await
    }

    async fn list_peers(&self) -> Result<Vec<PeerSummary>, ChatError> {
        let url = self.endpoint(&["messages", "users"])?;
        let response = self.http.get(url).send().await?;
        let body: serde_json::Value = read_json(response, "user list").await?;
        if !body.is_array() {
            debug!("peers: user list body is not an array; treating it as empty");
            return Ok(Vec::new());
        }
        serde_json::from_value(body)
            .map_err(|err| ChatError::MalformedResponse(format!("user list: {err}")))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, ChatError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(ChatError::TransportFailure {
            detail: format!("{what} request returned {status}"),
            server_message: ApiError::from_body(&body).map(|err| err.message),
        });
    }
    serde_json::from_slice(&body)
        .map_err(|err| ChatError::MalformedResponse(format!("{what}: {err}")))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
