//! Capability interface over a real-time peer connection.
//!
//! The negotiation engine only speaks to these traits. Concrete
//! implementations include:
//! - [`super::rtc::WebRtcBackend`]: the `webrtc` crate
//! - [`super::stub::StubBackend`]: in-memory double for testing

use std::fmt;

use strangers_proto::negotiation::{IceCandidate, SessionDescription};

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A discovery/relay server entry for the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct IceServer {
    /// `stun:` / `turn:` / `turns:` URLs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN server.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Local media capture could not be started.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaAccessError {
    /// The platform or user refused access.
    #[error("permission to use the camera/microphone was denied")]
    PermissionDenied,

    /// No capture devices are available.
    #[error("no camera/microphone available")]
    NoDevices,

    /// A device was found but failed to start.
    #[error("media device failure: {0}")]
    Device(String),
}

/// A single operation on the peer connection failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed: {reason}")]
pub struct RtcError {
    /// Operation that failed (`create offer`, `set remote description`, ...).
    pub operation: &'static str,
    /// Underlying error description.
    pub reason: String,
}

impl RtcError {
    pub fn new(operation: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Callback invoked for every locally discovered candidate.
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// Callback invoked for every track received from the remote side.
pub type TrackHandler<T> = Box<dyn Fn(T) + Send + Sync>;

/// A media track that can be stopped and released.
pub trait MediaTrack: Send + Sync + 'static {
    /// Audio or video.
    fn kind(&self) -> MediaKind;

    /// Stop the track and release its capture resources. Idempotent.
    fn stop(&self);
}

/// The local capture: one track per acquired device.
#[derive(Debug)]
pub struct LocalMedia<T> {
    tracks: Vec<T>,
}

impl<T: MediaTrack> LocalMedia<T> {
    #[must_use]
    pub const fn new(tracks: Vec<T>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[T] {
        &self.tracks
    }

    /// Whether a track of `kind` is present.
    #[must_use]
    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Stop every track.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Tracks received from the partner, in arrival order.
#[derive(Debug)]
pub struct RemoteStream<T> {
    tracks: Vec<T>,
}

impl<T> Default for RemoteStream<T> {
    fn default() -> Self {
        Self { tracks: Vec::new() }
    }
}

impl<T> RemoteStream<T> {
    pub fn push(&mut self, track: T) {
        self.tracks.push(track);
    }

    #[must_use]
    pub fn tracks(&self) -> &[T] {
        &self.tracks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// One real-time peer connection.
///
/// The async methods are the suspension points of a negotiation. Handler
/// registration and `close` are synchronous so teardown never waits.
pub trait PeerConnection: Send + Sync + 'static {
    /// Track type accepted by [`PeerConnection::add_track`].
    type LocalTrack: MediaTrack;
    /// Track type delivered to the track handler.
    type RemoteTrack: Send + Sync + 'static;

    /// Create an offer describing the local tracks.
    fn create_offer(
        &self,
    ) -> impl std::future::Future<Output = Result<SessionDescription, RtcError>> + Send;

    /// Create an answer to the applied remote offer.
    fn create_answer(
        &self,
    ) -> impl std::future::Future<Output = Result<SessionDescription, RtcError>> + Send;

    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    /// Add a remote candidate. Only valid once a remote description is set.
    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    fn add_track(
        &self,
        track: &Self::LocalTrack,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    /// Install (`Some`) or detach (`None`) the local candidate handler.
    fn on_candidate(&self, handler: Option<CandidateHandler>);

    /// Install (`Some`) or detach (`None`) the remote track handler.
    fn on_track(&self, handler: Option<TrackHandler<Self::RemoteTrack>>);

    /// Close the connection. Idempotent and non-blocking.
    fn close(&self);
}

/// Factory for media capture and peer connections.
pub trait RtcBackend: Send + Sync + 'static {
    type Peer: PeerConnection;

    /// Start audio and video capture.
    fn acquire_media(
        &self,
    ) -> impl std::future::Future<
        Output = Result<LocalMedia<<Self::Peer as PeerConnection>::LocalTrack>, MediaAccessError>,
    > + Send;

    /// Create a peer connection using the given discovery/relay servers.
    fn create_peer(
        &self,
        ice_servers: &[IceServer],
    ) -> impl std::future::Future<Output = Result<Self::Peer, RtcError>> + Send;
}
