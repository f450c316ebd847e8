//! In-memory RTC backend for testing.
//!
//! [`StubBackend`] hands out [`StubPeer`]s that record every call, keep the
//! installed handlers so tests can fire candidates and remote tracks, and
//! fail on demand. Clones of a backend share what they record, so a test can
//! keep one clone while the engine owns another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use strangers_proto::negotiation::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::Semaphore;

use super::peer::{
    CandidateHandler, IceServer, LocalMedia, MediaAccessError, MediaKind, MediaTrack,
    PeerConnection, RtcBackend, RtcError, TrackHandler,
};

/// One recorded call on a [`StubPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    AddTrack(MediaKind),
    Close,
}

/// A media track that only remembers whether it was stopped.
#[derive(Debug, Clone)]
pub struct StubTrack {
    kind: MediaKind,
    stopped: Arc<AtomicBool>,
}

impl StubTrack {
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for StubTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct PeerState {
    serial: usize,
    failing: Option<&'static str>,
    calls: Mutex<Vec<PeerCall>>,
    candidate_handler: Mutex<Option<CandidateHandler>>,
    track_handler: Mutex<Option<TrackHandler<StubTrack>>>,
    closed: AtomicBool,
}

/// Recording peer connection.
#[derive(Clone)]
pub struct StubPeer {
    state: Arc<PeerState>,
}

impl StubPeer {
    fn new(serial: usize, failing: Option<&'static str>) -> Self {
        Self {
            state: Arc::new(PeerState {
                serial,
                failing,
                calls: Mutex::new(Vec::new()),
                candidate_handler: Mutex::new(None),
                track_handler: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<PeerCall> {
        self.state.calls.lock().clone()
    }

    /// Number of offers created on this peer.
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == PeerCall::CreateOffer)
            .count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Whether any handler is still installed.
    #[must_use]
    pub fn has_handlers(&self) -> bool {
        self.state.candidate_handler.lock().is_some() || self.state.track_handler.lock().is_some()
    }

    /// Fire the local candidate handler. Returns `false` if none is installed.
    pub fn emit_candidate(&self, candidate: IceCandidate) -> bool {
        match self.state.candidate_handler.lock().as_ref() {
            Some(handler) => {
                handler(candidate);
                true
            }
            None => false,
        }
    }

    /// Fire the remote track handler. Returns `false` if none is installed.
    pub fn emit_track(&self, track: StubTrack) -> bool {
        match self.state.track_handler.lock().as_ref() {
            Some(handler) => {
                handler(track);
                true
            }
            None => false,
        }
    }

    fn record(&self, call: PeerCall, operation: &'static str) -> Result<(), RtcError> {
        self.state.calls.lock().push(call);
        if self.is_closed() {
            return Err(RtcError::new(operation, "peer connection is closed"));
        }
        if self.state.failing == Some(operation) {
            return Err(RtcError::new(operation, "simulated failure"));
        }
        Ok(())
    }
}

impl PeerConnection for StubPeer {
    type LocalTrack = StubTrack;
    type RemoteTrack = StubTrack;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.record(PeerCall::CreateOffer, "create offer")?;
        Ok(SessionDescription::offer(format!(
            "stub-offer-{}",
            self.state.serial
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.record(PeerCall::CreateAnswer, "create answer")?;
        Ok(SessionDescription::answer(format!(
            "stub-answer-{}",
            self.state.serial
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.record(
            PeerCall::SetLocal(description.kind),
            "set local description",
        )
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.record(
            PeerCall::SetRemote(description.kind),
            "set remote description",
        )
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.record(
            PeerCall::AddCandidate(candidate.candidate),
            "add ice candidate",
        )
    }

    async fn add_track(&self, track: &StubTrack) -> Result<(), RtcError> {
        self.record(PeerCall::AddTrack(track.kind()), "add track")
    }

    fn on_candidate(&self, handler: Option<CandidateHandler>) {
        *self.state.candidate_handler.lock() = handler;
    }

    fn on_track(&self, handler: Option<TrackHandler<StubTrack>>) {
        *self.state.track_handler.lock() = handler;
    }

    fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.state.calls.lock().push(PeerCall::Close);
        }
    }
}

/// Releases held media acquisitions of a gated [`StubBackend`].
#[derive(Clone)]
pub struct MediaGate(Arc<Semaphore>);

impl MediaGate {
    /// Let one pending (or future) media acquisition complete.
    pub fn release(&self) {
        self.0.add_permits(1);
    }
}

#[derive(Default)]
struct Recorded {
    peers: Mutex<Vec<StubPeer>>,
    tracks: Mutex<Vec<StubTrack>>,
    ice_servers: Mutex<Vec<Vec<IceServer>>>,
}

/// Recording [`RtcBackend`].
#[derive(Clone, Default)]
pub struct StubBackend {
    media_error: Option<MediaAccessError>,
    media_gate: Option<Arc<Semaphore>>,
    failing: Option<&'static str>,
    recorded: Arc<Recorded>,
}

impl StubBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every media acquisition fail with `error`.
    #[must_use]
    pub fn with_media_error(mut self, error: MediaAccessError) -> Self {
        self.media_error = Some(error);
        self
    }

    /// Make the named operation fail (`"create offer"`, `"set remote description"`, ...).
    #[must_use]
    pub fn with_failing(mut self, operation: &'static str) -> Self {
        self.failing = Some(operation);
        self
    }

    /// Hold every media acquisition until the returned gate releases it.
    #[must_use]
    pub fn with_media_gate(mut self) -> (Self, MediaGate) {
        let semaphore = Arc::new(Semaphore::new(0));
        self.media_gate = Some(Arc::clone(&semaphore));
        (self, MediaGate(semaphore))
    }

    /// Every peer created so far.
    #[must_use]
    pub fn peers(&self) -> Vec<StubPeer> {
        self.recorded.peers.lock().clone()
    }

    /// The most recently created peer.
    #[must_use]
    pub fn last_peer(&self) -> Option<StubPeer> {
        self.recorded.peers.lock().last().cloned()
    }

    /// Every local track handed out so far.
    #[must_use]
    pub fn acquired_tracks(&self) -> Vec<StubTrack> {
        self.recorded.tracks.lock().clone()
    }

    /// Server lists passed to each `create_peer` call.
    #[must_use]
    pub fn ice_servers_seen(&self) -> Vec<Vec<IceServer>> {
        self.recorded.ice_servers.lock().clone()
    }
}

impl RtcBackend for StubBackend {
    type Peer = StubPeer;

    async fn acquire_media(&self) -> Result<LocalMedia<StubTrack>, MediaAccessError> {
        if let Some(gate) = &self.media_gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        if let Some(error) = &self.media_error {
            return Err(error.clone());
        }
        let tracks = vec![StubTrack::new(MediaKind::Audio), StubTrack::new(MediaKind::Video)];
        self.recorded.tracks.lock().extend(tracks.iter().cloned());
        Ok(LocalMedia::new(tracks))
    }

    async fn create_peer(&self, ice_servers: &[IceServer]) -> Result<StubPeer, RtcError> {
        self.recorded.ice_servers.lock().push(ice_servers.to_vec());
        if self.failing == Some("create peer") {
            return Err(RtcError::new("create peer", "simulated failure"));
        }
        let mut peers = self.recorded.peers.lock();
        let peer = StubPeer::new(peers.len(), self.failing);
        peers.push(peer.clone());
        Ok(peer)
    }
}
