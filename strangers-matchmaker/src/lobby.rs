//! Lobby: connected clients, the waiting queue and the current pairings.
//!
//! Every operation takes the single state lock for its whole duration, so a
//! client is always in exactly one of three places: unknown, waiting, or
//! paired with exactly one partner. Outbound frames are pushed onto each
//! connection's unbounded channel and written by its writer task.

use std::collections::{HashMap, VecDeque};

use axum::extract::ws::Message;
use strangers_proto::codec;
use strangers_proto::signal::{SignalingEvent, SignalingRequest};
use tokio::sync::{RwLock, mpsc};

/// Default maximum accepted frame size in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Result of a `find_stranger` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Paired with the given partner.
    Paired(String),
    /// No compatible stranger yet; queued.
    Queued,
}

#[derive(Debug)]
struct WaitingEntry {
    id: String,
    keyword: String,
}

#[derive(Default)]
struct LobbyInner {
    /// Connection id to the sender feeding its WebSocket writer.
    connections: HashMap<String, mpsc::UnboundedSender<Message>>,
    /// Clients waiting for a partner, oldest first.
    waiting: VecDeque<WaitingEntry>,
    /// Symmetric pairing map.
    partners: HashMap<String, String>,
}

impl LobbyInner {
    fn send(&self, id: &str, event: &SignalingEvent) {
        let Some(sender) = self.connections.get(id) else {
            return;
        };
        match codec::encode(event) {
            Ok(text) => {
                // A closed channel means the connection is being torn down.
                let _ = sender.send(Message::Text(text.into()));
            }
            Err(e) => tracing::error!(error = %e, "failed to encode event"),
        }
    }

    fn broadcast(&self, event: &SignalingEvent) {
        for id in self.connections.keys() {
            self.send(id, event);
        }
    }

    fn broadcast_online_count(&self) {
        let count = u64::try_from(self.connections.len()).unwrap_or(u64::MAX);
        self.broadcast(&SignalingEvent::OnlineCount(count));
    }

    /// Drop `id` from the queue and from its pairing, notifying the partner.
    fn leave(&mut self, id: &str) {
        self.waiting.retain(|w| w.id != id);
        if let Some(partner) = self.partners.remove(id) {
            self.partners.remove(&partner);
            tracing::info!(id = %id, partner = %partner, "pairing dissolved");
            self.send(&partner, &SignalingEvent::PartnerDisconnected);
        }
    }
}

/// Shared matchmaker state.
pub struct Lobby {
    inner: RwLock<LobbyInner>,
    /// Maximum accepted inbound frame size in bytes.
    max_frame_size: usize,
}

impl Default for Lobby {
    fn default() -> Self {
        Self::new()
    }
}

impl Lobby {
    /// Creates an empty lobby with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates an empty lobby with a custom frame size limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            inner: RwLock::new(LobbyInner::default()),
            max_frame_size,
        }
    }

    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Adds a connection, greets it with `welcome` and broadcasts the new count.
    pub async fn register(&self, id: &str, sender: mpsc::UnboundedSender<Message>) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(id.to_string(), sender);
        inner.send(id, &SignalingEvent::Welcome { id: id.to_string() });
        inner.broadcast_online_count();
        tracing::info!(id = %id, online = inner.connections.len(), "client connected");
    }

    /// Removes a connection, releasing its queue slot or pairing, and
    /// broadcasts the new count.
    pub async fn unregister(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.leave(id);
        if inner.connections.remove(id).is_some() {
            inner.broadcast_online_count();
            tracing::info!(id = %id, online = inner.connections.len(), "client disconnected");
        }
    }

    /// Pairs `id` with the oldest waiting client sharing `keyword`, or queues it.
    ///
    /// Any current pairing or queue slot of `id` is released first.
    pub async fn find_stranger(&self, id: &str, keyword: &str) -> MatchOutcome {
        let mut inner = self.inner.write().await;
        inner.leave(id);

        let position = inner
            .waiting
            .iter()
            .position(|w| w.keyword == keyword && w.id != id);
        let Some(partner) = position
            .and_then(|index| inner.waiting.remove(index))
            .map(|w| w.id)
        else {
            inner.waiting.push_back(WaitingEntry {
                id: id.to_string(),
                keyword: keyword.to_string(),
            });
            tracing::debug!(id = %id, keyword = %keyword, "queued");
            return MatchOutcome::Queued;
        };

        inner.partners.insert(id.to_string(), partner.clone());
        inner.partners.insert(partner.clone(), id.to_string());
        inner.send(id, &SignalingEvent::Matched(partner.clone()));
        inner.send(&partner, &SignalingEvent::Matched(id.to_string()));
        tracing::info!(a = %id, b = %partner, keyword = %keyword, "paired");
        MatchOutcome::Paired(partner)
    }

    /// Leaves the queue or the current pairing.
    pub async fn leave(&self, id: &str) {
        self.inner.write().await.leave(id);
    }

    /// Forwards a partner-addressed request from `from`.
    ///
    /// The sender identity of the forwarded event is always `from`. Requests
    /// addressed to anyone but the current partner are answered with `error`.
    pub async fn relay(&self, from: &str, request: SignalingRequest) {
        let inner = self.inner.read().await;
        let (to, event) = match request {
            SignalingRequest::SendMessage { to, text } => (
                to,
                SignalingEvent::ReceiveMessage {
                    from: from.to_string(),
                    text,
                },
            ),
            SignalingRequest::Typing { to } => (to, SignalingEvent::StrangerTyping),
            SignalingRequest::StopTyping { to } => (to, SignalingEvent::StrangerStopTyping),
            SignalingRequest::WebrtcSignal { to, data } => (
                to,
                SignalingEvent::WebrtcSignal {
                    from: from.to_string(),
                    data,
                },
            ),
            other => {
                tracing::warn!(id = %from, request = ?other, "not a relayable request");
                return;
            }
        };

        if inner.partners.get(from).is_some_and(|p| *p == to) {
            inner.send(&to, &event);
        } else {
            tracing::warn!(from = %from, to = %to, "relay to a non-partner refused");
            inner.send(
                from,
                &SignalingEvent::Error {
                    reason: format!("not paired with {to}"),
                },
            );
        }
    }

    /// Sends an `error` event to one client.
    pub async fn send_error(&self, id: &str, reason: impl Into<String>) {
        let inner = self.inner.read().await;
        inner.send(
            id,
            &SignalingEvent::Error {
                reason: reason.into(),
            },
        );
    }

    /// Number of connected clients.
    pub async fn online_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Partner of `id`, if paired.
    pub async fn partner_of(&self, id: &str) -> Option<String> {
        self.inner.read().await.partners.get(id).cloned()
    }

    /// Whether `id` is in the waiting queue.
    pub async fn is_waiting(&self, id: &str) -> bool {
        self.inner.read().await.waiting.iter().any(|w| w.id == id)
    }

    /// Send a WebSocket Close frame to every connection.
    pub async fn close_all_connections(&self) {
        let inner = self.inner.read().await;
        for (id, sender) in &inner.connections {
            tracing::info!(id = %id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}
