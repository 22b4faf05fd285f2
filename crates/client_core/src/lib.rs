use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use shared::{
    domain::PeerId,
    protocol::{Message, OutgoingMessage, NEW_MESSAGE_EVENT},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod error;
pub mod events;
pub mod push;
pub mod state;
pub mod transport;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use error::{ChatError, ConfigError, ConnectError, PushError};
pub use events::{ClientEvent, Notification, NotificationKind};
pub use push::{EventHandler, EventStream, PushChannel};
pub use state::{Admission, ConversationSnapshot, PendingLivePolicy};
pub use transport::{HttpTransport, MessageTransport};

use state::{ConversationState, HistoryApply};

const HISTORY_FAILURE_TEXT: &str = "Failed to fetch messages";
const SEND_FAILURE_TEXT: &str = "Failed to send message";
const PEERS_FAILURE_TEXT: &str = "Failed to load users";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Replaced { count: usize },
    Failed(ChatError),
    /// The response arrived for a superseded load or a peer that is no
    /// longer active.
    Discarded,
    /// Blank peer id, or a peer other than the active one.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Appended(Message),
    /// The live echo was admitted before the confirmation.
    AlreadyPresent(Message),
    /// Stored by the server, but the active conversation changed before the
    /// confirmation arrived.
    NotDisplayed(Message),
    Failed(ChatError),
    Rejected(ChatError),
    Skipped,
}

#[derive(Debug)]
pub enum SubscribeOutcome {
    Attached,
    AlreadyAttached,
    Skipped,
    Failed(PushError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeersOutcome {
    Loaded { count: usize },
    Failed(ChatError),
}

/// The attached "newMessage" handler and the task bridging it into state.
/// Dropping it detaches the handler and stops the task.
struct ActiveSubscription {
    id: u64,
    _handler: EventHandler,
    task: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ClientInner {
    state: ConversationState,
    live: Option<ActiveSubscription>,
}

/// Conversation core for one authenticated session.
///
/// Owns the conversation state and serializes every mutation through a single
/// lock that is never held across an `.await`. Presentation layers read
/// [`ConversationSnapshot`]s and listen to [`ClientEvent`]s.
pub struct ConversationClient {
    transport: Arc<dyn MessageTransport>,
    push: PushChannel,
    inner: Mutex<ClientInner>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConversationClient {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        push: PushChannel,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.notification_capacity.max(1));
        Arc::new(Self {
            transport,
            push,
            inner: Mutex::new(ClientInner {
                state: ConversationState::new(settings.pending_live_policy),
                live: None,
            }),
            events,
        })
    }

    /// Builds the HTTP transport and opens the session's push channel for
    /// `user_id`.
    pub async fn connect(
        settings: &ClientSettings,
        user_id: &PeerId,
    ) -> Result<Arc<Self>, ConnectError> {
        let transport = HttpTransport::new(&settings.api_base_url)?;
        let push_url = settings.push_url()?;
        let push = PushChannel::connect(&push_url, user_id).await?;
        info!(
            api = %settings.api_base_url,
            push = %push_url,
            user_id = %user_id,
            "session: connected"
        );
        Ok(Self::new(Arc::new(transport), push, settings))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn push_channel(&self) -> &PushChannel {
        &self.push
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.inner.lock().state.snapshot()
    }

    /// Selects the conversation target without fetching or subscribing.
    pub fn set_active_peer(&self, peer_id: Option<PeerId>) {
        let detached = {
            let mut inner = self.inner.lock();
            if !inner.state.set_active_peer(peer_id) {
                return;
            }
            info!(
                peer_id = ?inner.state.active_peer().map(PeerId::as_str),
                "conversation: active peer changed"
            );
            if inner.state.subscription().is_none() {
                inner.live.take()
            } else {
                None
            }
        };
        if let Some(live) = detached {
            debug!(subscription_id = live.id, "live: detached subscription of previous peer");
        }
    }

    /// Fetches the conversation with `peer_id` and replaces the held messages
    /// with it. Only the active peer is loaded.
    pub async fn load_history(&self, peer_id: &PeerId) -> HistoryOutcome {
        let Some(generation) = self.start_history_load(peer_id) else {
            return HistoryOutcome::Skipped;
        };
        self.finish_history_load(peer_id, generation).await
    }

    /// Selects `peer_id`, then loads its history and subscribes to live
    /// messages. The load is registered before the subscription so live
    /// messages arriving meanwhile fall under the pending-live policy. Must
    /// run within a Tokio runtime.
    pub async fn open_conversation(self: &Arc<Self>, peer_id: PeerId) -> HistoryOutcome {
        self.unsubscribe();
        self.set_active_peer(Some(peer_id.clone()));
        let Some(generation) = self.start_history_load(&peer_id) else {
            return HistoryOutcome::Skipped;
        };
        if let SubscribeOutcome::Failed(err) = self.subscribe() {
            warn!(peer_id = %peer_id, "live: subscribe failed: {err}");
        }
        self.finish_history_load(&peer_id, generation).await
    }

    fn start_history_load(&self, peer_id: &PeerId) -> Option<u64> {
        if peer_id.is_blank() {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.state.active_peer() != Some(peer_id) {
            debug!(peer_id = %peer_id, "history: skipping load for inactive peer");
            return None;
        }
        Some(inner.state.begin_history_load(peer_id))
    }

    async fn finish_history_load(&self, peer_id: &PeerId, generation: u64) -> HistoryOutcome {
        info!(peer_id = %peer_id, generation, "history: loading");
        let result = self.transport.fetch_history(peer_id).await;

        let (applied, replaced) = {
            let mut inner = self.inner.lock();
            let applied = inner.state.complete_history_load(generation, peer_id, result);
            let replaced = matches!(applied, HistoryApply::Replaced { .. })
                .then(|| inner.state.messages().to_vec());
            (applied, replaced)
        };

        match applied {
            HistoryApply::Replaced { count } => {
                info!(peer_id = %peer_id, count, "history: replaced");
                if let Some(messages) = replaced {
                    let _ = self.events.send(ClientEvent::HistoryReplaced {
                        peer_id: peer_id.clone(),
                        messages,
                    });
                }
                HistoryOutcome::Replaced { count }
            }
            HistoryApply::Failed(err) => {
                warn!(peer_id = %peer_id, "history: load failed: {err}");
                self.notify(&err, HISTORY_FAILURE_TEXT);
                HistoryOutcome::Failed(err)
            }
            HistoryApply::Discarded => {
                debug!(peer_id = %peer_id, generation, "history: discarded stale response");
                HistoryOutcome::Discarded
            }
        }
    }

    /// Attaches the live-message handler for the active peer. Idempotent
    /// while a subscription for the active peer exists. Spawns the bridge
    /// task, so it must be called from within a Tokio runtime.
    pub fn subscribe(self: &Arc<Self>) -> SubscribeOutcome {
        let mut inner = self.inner.lock();
        if inner.state.active_peer().is_none() {
            debug!("live: subscribe skipped without active peer");
            return SubscribeOutcome::Skipped;
        }
        if inner.state.is_subscribed() && inner.live.is_some() {
            return SubscribeOutcome::AlreadyAttached;
        }

        inner.state.end_subscription();
        drop(inner.live.take());
        let Some(scope) = inner.state.begin_subscription() else {
            return SubscribeOutcome::Skipped;
        };

        let (handler, stream) = match self.push.attach(NEW_MESSAGE_EVENT) {
            Ok(attached) => attached,
            Err(err) => {
                inner.state.end_subscription();
                error!(peer_id = %scope.peer, "live: {err}");
                return SubscribeOutcome::Failed(err);
            }
        };
        let task = tokio::spawn(run_live_bridge(Arc::downgrade(self), scope.id, stream));
        inner.live = Some(ActiveSubscription {
            id: scope.id,
            _handler: handler,
            task,
        });
        info!(peer_id = %scope.peer, subscription_id = scope.id, "live: subscribed");
        SubscribeOutcome::Attached
    }

    /// Detaches the live-message handler. Returns `false` when none was
    /// attached.
    pub fn unsubscribe(&self) -> bool {
        let detached = {
            let mut inner = self.inner.lock();
            inner.state.end_subscription();
            inner.live.take()
        };
        match detached {
            Some(live) => {
                info!(subscription_id = live.id, "live: unsubscribed");
                true
            }
            None => false,
        }
    }

    fn admit_live_message(&self, subscription_id: u64, message: Message) -> Admission {
        let admission = self
            .inner
            .lock()
            .state
            .admit_live(subscription_id, message.clone());
        match admission {
            Admission::Appended => {
                debug!(message_id = %message.id, "live: appended");
                let _ = self.events.send(ClientEvent::MessageAppended(message));
            }
            Admission::Duplicate => {
                debug!(message_id = %message.id, "live: dropped duplicate");
            }
            other => {
                debug!(message_id = %message.id, admission = ?other, "live: message not admitted");
            }
        }
        admission
    }

    fn handle_push_closed(&self, subscription_id: u64) {
        let detached = {
            let mut inner = self.inner.lock();
            if inner.live.as_ref().map(|live| live.id) != Some(subscription_id) {
                return;
            }
            inner.state.end_subscription();
            inner.live.take()
        };
        warn!(subscription_id, "live: push channel closed; subscription ended");
        let _ = self.events.send(ClientEvent::PushChannelClosed);
        drop(detached);
    }

    /// Posts `payload` to the active peer and appends the server's stored
    /// copy. The payload is borrowed so the caller keeps it on failure.
    pub async fn send_message(&self, payload: &OutgoingMessage) -> SendOutcome {
        let active = self.inner.lock().state.active_peer().cloned();
        let Some(peer_id) = active else {
            debug!("send: skipped without active peer");
            return SendOutcome::Skipped;
        };
        if payload.is_empty() {
            debug!(peer_id = %peer_id, "send: rejected empty payload");
            return SendOutcome::Rejected(ChatError::EmptyPayload);
        }

        match self.transport.send_message(&peer_id, payload).await {
            Ok(message) => {
                let admission = self.inner.lock().state.admit(message.clone());
                match admission {
                    Admission::Appended => {
                        info!(peer_id = %peer_id, message_id = %message.id, "send: delivered");
                        let _ = self
                            .events
                            .send(ClientEvent::MessageAppended(message.clone()));
                        SendOutcome::Appended(message)
                    }
                    Admission::Duplicate => {
                        debug!(message_id = %message.id, "send: live echo arrived first");
                        SendOutcome::AlreadyPresent(message)
                    }
                    other => {
                        info!(
                            peer_id = %peer_id,
                            message_id = %message.id,
                            admission = ?other,
                            "send: delivered after conversation changed"
                        );
                        SendOutcome::NotDisplayed(message)
                    }
                }
            }
            Err(err) => {
                warn!(peer_id = %peer_id, "send: failed: {err}");
                self.notify(&err, SEND_FAILURE_TEXT);
                SendOutcome::Failed(err)
            }
        }
    }

    /// Refreshes the directory of peers the user can open a conversation
    /// with. A failed refresh keeps the previous list.
    pub async fn load_peers(&self) -> PeersOutcome {
        self.inner.lock().state.begin_peers_load();
        let result = self.transport.list_peers().await;

        match result {
            Ok(peers) => {
                let count = peers.len();
                self.inner.lock().state.complete_peers_load(Ok(peers.clone()));
                info!(count, "peers: loaded");
                let _ = self.events.send(ClientEvent::PeersUpdated(peers));
                PeersOutcome::Loaded { count }
            }
            Err(err) => {
                self.inner
                    .lock()
                    .state
                    .complete_peers_load(Err(err.clone()));
                warn!("peers: load failed: {err}");
                self.notify(&err, PEERS_FAILURE_TEXT);
                PeersOutcome::Failed(err)
            }
        }
    }

    /// Session end: detaches the live handler and clears every field.
    pub fn reset(&self) {
        let detached = {
            let mut inner = self.inner.lock();
            inner.state.reset();
            inner.live.take()
        };
        drop(detached);
        info!("session: reset");
    }

    fn notify(&self, err: &ChatError, fallback: &str) {
        if !err.is_user_visible() {
            return;
        }
        let _ = self
            .events
            .send(ClientEvent::Notification(Notification::from_failure(
                err, fallback,
            )));
    }
}

async fn run_live_bridge(
    client: Weak<ConversationClient>,
    subscription_id: u64,
    mut stream: EventStream,
) {
    while let Some(payload) = stream.next_payload().await {
        let Some(client) = client.upgrade() else {
            return;
        };
        match serde_json::from_value::<Message>(payload) {
            Ok(message) => {
                client.admit_live_message(subscription_id, message);
            }
            Err(err) => {
                warn!(subscription_id, "live: dropping undecodable {NEW_MESSAGE_EVENT} payload: {err}");
            }
        }
    }
    if let Some(client) = client.upgrade() {
        client.handle_push_closed(subscription_id);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
