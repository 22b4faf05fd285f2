use shared::{
    domain::PeerId,
    protocol::{Message, PeerSummary},
};

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NotificationKind {
    Error,
}

/// Transient user-facing notice (a toast in graphical frontends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    /// Prefers the server's own wording over the operation's fallback text.
    pub fn from_failure(err: &ChatError, fallback: &str) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: err.server_message().unwrap_or(fallback).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    HistoryReplaced {
        peer_id: PeerId,
        messages: Vec<Message>,
    },
    MessageAppended(Message),
    PeersUpdated(Vec<PeerSummary>),
    Notification(Notification),
    PushChannelClosed,
}
