//! Signaling channel abstraction for `Strangers`.
//!
//! Defines the [`SignalingChannel`] trait the session engine talks through.
//! Concrete implementations include:
//! - [`ws::WsSignalingChannel`]: WebSocket connection to a matchmaker
//! - [`loopback::LoopbackChannel`]: in-process channel for testing

pub mod loopback;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use strangers_proto::codec::CodecError;
use strangers_proto::negotiation::NegotiationPayload;
use strangers_proto::signal::{SignalingEvent, SignalingRequest};
use tokio::sync::mpsc;

/// Opaque identity issued by the matchmaker for one live connection.
///
/// Identities are compared lexicographically (byte order of the UTF-8
/// string); the ordering decides which side of a match makes the offer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from its string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this identity.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while talking to the matchmaker.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The connection to the matchmaker has been closed.
    #[error("connection closed")]
    Closed,

    /// The operation timed out before completing.
    #[error("signaling operation timed out")]
    Timeout,

    /// The matchmaker could not be reached at all.
    #[error("matchmaker at {0} is unreachable")]
    Unreachable(String),

    /// The server did not complete the welcome handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("signaling I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract over the bidirectional event channel to the matchmaker.
///
/// Delivery is reliable and ordered per connection; implementations never
/// reorder or deduplicate. A subscription receiver that returns `None`
/// means the underlying connection is gone.
pub trait SignalingChannel: Send + Sync {
    /// Identity issued to this connection, once known.
    fn local_identity(&self) -> Option<Identity>;

    /// Start receiving inbound events.
    ///
    /// Events that arrived before the first subscription are buffered and
    /// delivered to it. A later subscription replaces the earlier one.
    fn subscribe(&self) -> mpsc::Receiver<SignalingEvent>;

    /// Stop receiving inbound events; the current receiver ends.
    fn unsubscribe(&self);

    /// Send one request frame to the matchmaker.
    fn send(
        &self,
        request: SignalingRequest,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send;

    /// Ask for a stranger sharing `keyword`.
    fn send_find_match(
        &self,
        keyword: &str,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send {
        self.send(SignalingRequest::FindStranger {
            keyword: keyword.to_string(),
        })
    }

    /// Send a chat line to the partner.
    fn send_chat_message(
        &self,
        to: &Identity,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send {
        self.send(SignalingRequest::SendMessage {
            to: to.as_str().to_string(),
            text: text.to_string(),
        })
    }

    /// Tell the partner the local user is typing.
    fn send_typing(
        &self,
        to: &Identity,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send {
        self.send(SignalingRequest::Typing {
            to: to.as_str().to_string(),
        })
    }

    /// Tell the partner the local user stopped typing.
    fn send_stop_typing(
        &self,
        to: &Identity,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send {
        self.send(SignalingRequest::StopTyping {
            to: to.as_str().to_string(),
        })
    }

    /// Relay a negotiation payload to the partner.
    fn send_negotiation_payload(
        &self,
        to: &Identity,
        payload: &NegotiationPayload,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send {
        let request = payload.to_value().map(|data| SignalingRequest::WebrtcSignal {
            to: to.as_str().to_string(),
            data,
        });
        async move { self.send(request?).await }
    }

    /// Leave the waiting queue or the current pairing.
    fn send_leave(&self) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send {
        self.send(SignalingRequest::LeaveChat)
    }
}

/// Subscriber bookkeeping shared by the channel adapters.
///
/// Holds the sender half the inbound side pushes into, plus the receiver
/// created up front so events arriving before the first `subscribe` call
/// are not lost.
pub(crate) struct Subscription {
    capacity: usize,
    sender: Arc<parking_lot::Mutex<Option<mpsc::Sender<SignalingEvent>>>>,
    initial: parking_lot::Mutex<Option<mpsc::Receiver<SignalingEvent>>>,
}

impl Subscription {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            sender: Arc::new(parking_lot::Mutex::new(Some(tx))),
            initial: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Shared slot for the inbound side (reader task, test handle).
    pub(crate) fn slot(&self) -> Arc<parking_lot::Mutex<Option<mpsc::Sender<SignalingEvent>>>> {
        Arc::clone(&self.sender)
    }

    pub(crate) fn subscribe(&self, open: bool) -> mpsc::Receiver<SignalingEvent> {
        if let Some(rx) = self.initial.lock().take() {
            return rx;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        if open {
            *self.sender.lock() = Some(tx);
        }
        // When closed, `tx` is dropped here and the receiver ends immediately.
        rx
    }

    pub(crate) fn unsubscribe(&self) {
        self.initial.lock().take();
        self.sender.lock().take();
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Push an event to whoever currently holds the subscription.
///
/// Returns `false` when nobody is listening.
pub(crate) async fn deliver(
    slot: &parking_lot::Mutex<Option<mpsc::Sender<SignalingEvent>>>,
    event: SignalingEvent,
) -> bool {
    // Clone the sender so the lock is not held across the await.
    let sender = slot.lock().clone();
    match sender {
        Some(tx) => tx.send(event).await.is_ok(),
        None => false,
    }
}
