//! Loopback signaling channel for testing.
//!
//! [`LoopbackChannel::new`] returns the channel together with a
//! [`LoopbackHandle`] that plays the matchmaker: it injects inbound events,
//! observes outbound requests, and can simulate failed sends or a dropped
//! connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use strangers_proto::signal::{SignalingEvent, SignalingRequest};
use tokio::sync::mpsc;

use super::{ChannelError, Identity, SignalingChannel, Subscription, deliver};

/// Buffer size for the inbound event channel.
const EVENT_BUFFER: usize = 64;

/// In-process [`SignalingChannel`] backed by `tokio::sync::mpsc` channels.
pub struct LoopbackChannel {
    identity: Option<Identity>,
    outbound: mpsc::UnboundedSender<SignalingRequest>,
    subscription: Arc<Subscription>,
    closed: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

/// Server side of a [`LoopbackChannel`].
pub struct LoopbackHandle {
    sent: mpsc::UnboundedReceiver<SignalingRequest>,
    subscription: Arc<Subscription>,
    closed: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl LoopbackChannel {
    /// Create a channel whose welcome handshake issued `identity`.
    #[must_use]
    pub fn new(identity: Identity) -> (Self, LoopbackHandle) {
        Self::build(Some(identity))
    }

    /// Create a channel that has not been issued an identity.
    #[must_use]
    pub fn without_identity() -> (Self, LoopbackHandle) {
        Self::build(None)
    }

    fn build(identity: Option<Identity>) -> (Self, LoopbackHandle) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let subscription = Arc::new(Subscription::new(EVENT_BUFFER));
        let closed = Arc::new(AtomicBool::new(false));
        let fail_sends = Arc::new(AtomicBool::new(false));

        let channel = Self {
            identity,
            outbound,
            subscription: Arc::clone(&subscription),
            closed: Arc::clone(&closed),
            fail_sends: Arc::clone(&fail_sends),
        };
        let handle = LoopbackHandle {
            sent,
            subscription,
            closed,
            fail_sends,
        };
        (channel, handle)
    }
}

impl SignalingChannel for LoopbackChannel {
    fn local_identity(&self) -> Option<Identity> {
        self.identity.clone()
    }

    fn subscribe(&self) -> mpsc::Receiver<SignalingEvent> {
        self.subscription
            .subscribe(!self.closed.load(Ordering::Relaxed))
    }

    fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    async fn send(&self, request: SignalingRequest) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ChannelError::Closed);
        }
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(ChannelError::Io(std::io::Error::other(
                "simulated send failure",
            )));
        }
        self.outbound
            .send(request)
            .map_err(|_| ChannelError::Closed)
    }
}

impl LoopbackHandle {
    /// Deliver an inbound event to the subscriber.
    ///
    /// Returns `false` if nobody is subscribed.
    pub async fn inject(&self, event: SignalingEvent) -> bool {
        deliver(&self.subscription.slot(), event).await
    }

    /// Drain every request sent so far.
    pub fn sent(&mut self) -> Vec<SignalingRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.sent.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Wait up to `timeout` for the next sent request.
    pub async fn next_sent(&mut self, timeout: Duration) -> Option<SignalingRequest> {
        tokio::time::timeout(timeout, self.sent.recv())
            .await
            .ok()
            .flatten()
    }

    /// Simulate loss of the connection: the subscription ends and sends fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.subscription.slot().lock().take();
    }

    /// Make every subsequent send fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Whether a live subscriber is attached.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_subscribed()
    }
}
