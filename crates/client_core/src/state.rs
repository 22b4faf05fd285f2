//! Conversation state store.
//!
//! Pure state transitions for one session's conversation view. Nothing in
//! here performs I/O; [`crate::ConversationClient`] serializes access to a
//! single [`ConversationState`] and drives these transitions around its
//! request/response and push-channel boundaries.

use std::{collections::HashSet, mem};

use serde::Deserialize;
use shared::{
    domain::{MessageId, PeerId},
    protocol::{Message, PeerSummary},
};
use tracing::warn;

use crate::error::ChatError;

/// What happens to live messages admitted while a history load is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingLivePolicy {
    /// The wholesale replace discards them.
    #[default]
    Drop,
    /// They are re-appended after the replace unless history already has them.
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Appended,
    Duplicate,
    NoActivePeer,
    ForeignConversation,
    /// The held messages belong to a previous peer whose replacement has not
    /// started loading yet.
    StaleView,
    /// Delivered by a subscription that is no longer attached.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionScope {
    pub id: u64,
    pub peer: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryApply {
    Replaced { count: usize },
    Failed(ChatError),
    Discarded,
}

/// Read-only copy handed to presentation layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub active_peer: Option<PeerId>,
    pub messages: Vec<Message>,
    pub is_history_loading: bool,
    pub is_subscribed: bool,
    pub peers: Vec<PeerSummary>,
    pub is_peers_loading: bool,
}

#[derive(Debug, Default)]
pub struct ConversationState {
    active_peer: Option<PeerId>,
    messages_peer: Option<PeerId>,
    messages: Vec<Message>,
    message_ids: HashSet<MessageId>,
    /// Peer of the latest load still awaiting its response.
    loading_peer: Option<PeerId>,
    load_generation: u64,
    live_during_load: Vec<Message>,
    subscription: Option<SubscriptionScope>,
    next_subscription_id: u64,
    peers: Vec<PeerSummary>,
    is_peers_loading: bool,
    pending_live_policy: PendingLivePolicy,
}

impl ConversationState {
    pub fn new(pending_live_policy: PendingLivePolicy) -> Self {
        Self {
            pending_live_policy,
            ..Self::default()
        }
    }

    pub fn active_peer(&self) -> Option<&PeerId> {
        self.active_peer.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// True only while the pending load belongs to the active peer.
    pub fn is_history_loading(&self) -> bool {
        self.loading_peer.is_some() && self.loading_peer == self.active_peer
    }

    pub fn is_subscribed(&self) -> bool {
        match (&self.subscription, &self.active_peer) {
            (Some(scope), Some(peer)) => scope.peer == *peer,
            _ => false,
        }
    }

    pub fn subscription(&self) -> Option<&SubscriptionScope> {
        self.subscription.as_ref()
    }

    pub fn peers(&self) -> &[PeerSummary] {
        &self.peers
    }

    pub fn is_peers_loading(&self) -> bool {
        self.is_peers_loading
    }

    pub fn pending_live_policy(&self) -> PendingLivePolicy {
        self.pending_live_policy
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            active_peer: self.active_peer.clone(),
            messages: self.messages.clone(),
            is_history_loading: self.is_history_loading(),
            is_subscribed: self.is_subscribed(),
            peers: self.peers.clone(),
            is_peers_loading: self.is_peers_loading,
        }
    }

    /// Selects the conversation target. Held messages are left in place; a
    /// subscription scoped to a different peer is ended. Returns `false` when
    /// the active peer did not change.
    pub fn set_active_peer(&mut self, peer: Option<PeerId>) -> bool {
        let peer = peer.filter(|peer| !peer.is_blank());
        if self.active_peer == peer {
            return false;
        }
        self.active_peer = peer;
        if !self.is_subscribed() {
            self.subscription = None;
        }
        true
    }

    /// Starts a load for `peer` and returns its generation. Messages held for
    /// another peer are cleared right away so the view never shows them under
    /// the new conversation.
    pub fn begin_history_load(&mut self, peer: &PeerId) -> u64 {
        self.load_generation += 1;
        if self.messages_peer.as_ref() != Some(peer) {
            self.clear_messages();
            self.messages_peer = Some(peer.clone());
        }
        self.loading_peer = Some(peer.clone());
        self.live_during_load.clear();
        self.load_generation
    }

    /// Applies the response of load `generation` for `peer`. Responses from a
    /// superseded load, or for a peer that is no longer active, are discarded.
    pub fn complete_history_load(
        &mut self,
        generation: u64,
        peer: &PeerId,
        result: Result<Vec<Message>, ChatError>,
    ) -> HistoryApply {
        let is_latest = generation == self.load_generation;
        if !is_latest || self.active_peer.as_ref() != Some(peer) {
            if is_latest {
                self.loading_peer = None;
                self.live_during_load.clear();
            }
            return HistoryApply::Discarded;
        }

        self.loading_peer = None;
        let buffered = mem::take(&mut self.live_during_load);
        match result {
            Ok(history) => {
                self.replace_messages(peer, history);
                if self.pending_live_policy == PendingLivePolicy::Replay {
                    for message in buffered {
                        self.push_unique(message);
                    }
                }
                HistoryApply::Replaced {
                    count: self.messages.len(),
                }
            }
            Err(err) => {
                self.clear_messages();
                HistoryApply::Failed(err)
            }
        }
    }

    /// Admission rule shared by the live bridge and the send path.
    pub fn admit(&mut self, message: Message) -> Admission {
        let Some(active) = self.active_peer.clone() else {
            return Admission::NoActivePeer;
        };
        if !message.involves(&active) {
            return Admission::ForeignConversation;
        }
        if self.messages_peer.as_ref() != Some(&active) {
            if !self.messages.is_empty() {
                return Admission::StaleView;
            }
            self.messages_peer = Some(active);
        }
        if self.message_ids.contains(&message.id) {
            return Admission::Duplicate;
        }

        if self.is_history_loading() && self.pending_live_policy == PendingLivePolicy::Replay {
            self.live_during_load.push(message.clone());
        }
        self.push_unique(message);
        Admission::Appended
    }

    /// Admission for a message delivered by subscription `subscription_id`.
    pub fn admit_live(&mut self, subscription_id: u64, message: Message) -> Admission {
        if !self.is_subscribed()
            || self.subscription.as_ref().map(|scope| scope.id) != Some(subscription_id)
        {
            return Admission::Detached;
        }
        self.admit(message)
    }

    /// Opens a subscription scope for the active peer, or `None` without one.
    pub fn begin_subscription(&mut self) -> Option<SubscriptionScope> {
        let peer = self.active_peer.clone()?;
        self.next_subscription_id += 1;
        let scope = SubscriptionScope {
            id: self.next_subscription_id,
            peer,
        };
        self.subscription = Some(scope.clone());
        Some(scope)
    }

    pub fn end_subscription(&mut self) -> Option<SubscriptionScope> {
        self.subscription.take()
    }

    pub fn begin_peers_load(&mut self) {
        self.is_peers_loading = true;
    }

    /// A failed load keeps the previous list.
    pub fn complete_peers_load(&mut self, result: Result<Vec<PeerSummary>, ChatError>) -> bool {
        self.is_peers_loading = false;
        match result {
            Ok(peers) => {
                self.peers = peers;
                true
            }
            Err(_) => false,
        }
    }

    /// Session end. Counters keep running so that work started before the
    /// reset can never match a scope or load opened after it.
    pub fn reset(&mut self) {
        *self = Self {
            load_generation: self.load_generation,
            next_subscription_id: self.next_subscription_id,
            pending_live_policy: self.pending_live_policy,
            ..Self::default()
        };
    }

    fn replace_messages(&mut self, peer: &PeerId, history: Vec<Message>) {
        self.clear_messages();
        self.messages_peer = Some(peer.clone());
        self.messages.reserve(history.len());
        for message in history {
            if !self.push_unique(message) {
                warn!(peer_id = %peer, "history: dropped repeated message id in fetched history");
            }
        }
    }

    fn clear_messages(&mut self) {
        self.messages.clear();
        self.message_ids.clear();
    }

    fn push_unique(&mut self, message: Message) -> bool {
        if !self.message_ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
