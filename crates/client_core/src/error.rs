use thiserror::Error;

/// Failure kinds of the conversation operations. None of them is fatal:
/// every operation catches them at its boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("transport failure: {detail}")]
    TransportFailure {
        detail: String,
        server_message: Option<String>,
    },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("message has neither text nor image")]
    EmptyPayload,
}

impl ChatError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::TransportFailure {
            detail: detail.into(),
            server_message: None,
        }
    }

    /// Message supplied by the server in its error body, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::TransportFailure { server_message, .. } => server_message.as_deref(),
            _ => None,
        }
    }

    /// Whether this failure is shown to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure { .. } | Self::MalformedResponse(_)
        )
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        Self::transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("a handler for push event `{0}` is already attached")]
    HandlerAlreadyAttached(String),
    #[error("push channel is closed")]
    Closed,
    #[error("invalid push url `{0}`")]
    InvalidUrl(String),
    #[error("failed to connect push channel {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid api base url `{url}`: {reason}")]
    InvalidApiUrl { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Push(#[from] PushError),
}
