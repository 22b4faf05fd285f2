use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Parses an error body, ignoring bodies without a usable message.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(body)
            .ok()
            .filter(|err| !err.message.trim().is_empty())
    }
}
