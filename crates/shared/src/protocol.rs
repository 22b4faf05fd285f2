use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, PeerId};

/// Push event name carrying a freshly stored [`Message`].
pub const NEW_MESSAGE_EVENT: &str = "newMessage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: MessageId,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// True when `peer` is on either end of this message.
    pub fn involves(&self, peer: &PeerId) -> bool {
        self.sender_id == *peer || self.receiver_id == *peer
    }
}

/// Body of `POST /messages/send/{peerId}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    /// Attaches an inline image as a `data:` URL, the form the server
    /// uploads to its media store.
    pub fn with_image_bytes(mut self, bytes: &[u8], mime_type: &str) -> Self {
        self.image = Some(image_data_url(bytes, mime_type));
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image = Some(url.into());
        self
    }

    /// Neither non-blank text nor an image.
    pub fn is_empty(&self) -> bool {
        let has_text = self
            .text
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty());
        !has_text && self.image.is_none()
    }
}

pub fn image_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Entry of `GET /messages/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    #[serde(alias = "_id")]
    pub id: PeerId,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
}

/// Text frame on the push channel: a named event and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PushFrame {
    pub fn new_message(message: &Message) -> serde_json::Result<Self> {
        Ok(Self {
            event: NEW_MESSAGE_EVENT.to_string(),
            data: serde_json::to_value(message)?,
        })
    }

    pub fn is_named(&self, event: &str) -> bool {
        self.event == event
    }
}
