//! Session-scoped push channel.
//!
//! One [`PushChannel`] exists per authenticated session. It routes each
//! decoded frame to the handler attached for the frame's event name and
//! allows at most one handler per name: attaching a second one fails until
//! the first [`EventHandler`] is dropped. Once closed, a channel accepts no
//! further attachments.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use futures::StreamExt;
use parking_lot::Mutex;
use shared::{domain::PeerId, protocol::PushFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::PushError;

struct Attachment {
    id: u64,
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

#[derive(Default)]
struct PushChannelInner {
    attached: Mutex<HashMap<String, Attachment>>,
    next_attachment: AtomicU64,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct PushChannel {
    inner: Arc<PushChannelInner>,
}

impl PushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the WebSocket push connection for `user_id` and feeds its text
    /// frames into a new channel until the socket closes.
    pub async fn connect(push_url: &Url, user_id: &PeerId) -> Result<Self, PushError> {
        match push_url.scheme() {
            "ws" | "wss" => {}
            _ => return Err(PushError::InvalidUrl(push_url.to_string())),
        }
        let mut url = push_url.clone();
        url.query_pairs_mut().append_pair("userId", user_id.as_str());

        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|source| PushError::Connect {
                    url: url.to_string(),
                    source,
                })?;
        info!(user_id = %user_id, "push: connected");
        let (_, mut ws_reader) = ws_stream.split();

        let channel = Self::new();
        let feed = channel.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<PushFrame>(&text) {
                        Ok(frame) => feed.publish(frame),
                        Err(err) => warn!("push: ignoring undecodable frame: {err}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("push: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            info!("push: connection closed");
            feed.close();
        });

        Ok(channel)
    }

    /// Queues the payload of `frame` for the handler attached to its event
    /// name. Queues are unbounded so a slow handler never loses frames.
    pub fn publish(&self, frame: PushFrame) {
        let attached = self.inner.attached.lock();
        match attached.get(&frame.event) {
            Some(attachment) => {
                let _ = attachment.tx.send(frame.data);
            }
            None => debug!(event = %frame.event, "push: no handler for frame"),
        }
    }

    /// Ends every handler's stream and refuses later attachments.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.attached.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self, event: &str) -> bool {
        self.inner.attached.lock().contains_key(event)
    }

    pub fn attach(&self, event: &str) -> Result<(EventHandler, EventStream), PushError> {
        let mut attached = self.inner.attached.lock();
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        if attached.contains_key(event) {
            return Err(PushError::HandlerAlreadyAttached(event.to_string()));
        }
        let id = self.inner.next_attachment.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        attached.insert(event.to_string(), Attachment { id, tx });
        drop(attached);
        debug!(event, "push: handler attached");

        Ok((
            EventHandler {
                event: event.to_string(),
                id,
                channel: Arc::clone(&self.inner),
            },
            EventStream { rx },
        ))
    }
}

/// Attachment of one event name; dropping it detaches the handler.
pub struct EventHandler {
    event: String,
    id: u64,
    channel: Arc<PushChannelInner>,
}

impl EventHandler {
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        let mut attached = self.channel.attached.lock();
        if attached.get(&self.event).is_some_and(|a| a.id == self.id) {
            attached.remove(&self.event);
            debug!(event = %self.event, "push: handler detached");
        }
    }
}

/// Payloads of the attached event, in arrival order.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl EventStream {
    /// Next payload for this event, or `None` once the channel has closed.
    pub async fn next_payload(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
