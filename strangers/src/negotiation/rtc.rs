//! [`RtcBackend`] over the `webrtc` crate.
//!
//! Local media is a single PCMU audio track fed from the default microphone
//! (see `capture`). There is no camera encoder, so every peer negotiates
//! video receive-only and the partner's camera still arrives through
//! `on_track`. When capture is disabled in the configuration, media
//! acquisition reports [`MediaAccessError::NoDevices`] and the session stays
//! text-only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use strangers_proto::negotiation::{IceCandidate, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::capture::{self, PCMU_RATE};
use super::peer::{
    CandidateHandler, IceServer, LocalMedia, MediaAccessError, MediaKind, MediaTrack,
    PeerConnection, RtcBackend, RtcError, TrackHandler,
};

/// Stream id of the local media.
const LOCAL_STREAM_ID: &str = "strangers-local";

/// A local sample track fed by the microphone.
#[derive(Clone)]
pub struct SampleTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: Arc<AtomicBool>,
}

impl SampleTrack {
    /// A PCMU audio track, not yet fed.
    #[must_use]
    pub fn audio() -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                ..Default::default()
            },
            "audio".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        );
        Self {
            kind: MediaKind::Audio,
            track: Arc::new(track),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Push one encoded sample. Samples written after `stop` are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError`] if the track rejects the sample.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), RtcError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| RtcError::new("write sample", e))
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl MediaTrack for SampleTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed) {
            tracing::debug!(kind = %self.kind, "local track stopped");
        }
    }
}

/// A track received from the partner.
#[derive(Clone)]
pub struct RemoteMediaTrack {
    track: Arc<TrackRemote>,
}

impl RemoteMediaTrack {
    /// Audio or video, if the codec type is known.
    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        match self.track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            RTPCodecType::Unspecified => None,
        }
    }

    /// The underlying RTP track, for a renderer to read packets from.
    #[must_use]
    pub fn track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

/// Peer connection backed by [`RTCPeerConnection`].
///
/// The `webrtc` callbacks are installed once at construction and forward to
/// swappable handler slots, so detaching a handler takes effect immediately.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    candidate_handler: Arc<Mutex<Option<CandidateHandler>>>,
    track_handler: Arc<Mutex<Option<TrackHandler<RemoteMediaTrack>>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let candidate_handler: Arc<Mutex<Option<CandidateHandler>>> = Arc::new(Mutex::new(None));
        let track_handler: Arc<Mutex<Option<TrackHandler<RemoteMediaTrack>>>> =
            Arc::new(Mutex::new(None));

        let candidate_slot = Arc::clone(&candidate_handler);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering.
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        if let Some(handler) = candidate_slot.lock().as_ref() {
                            handler(from_rtc_candidate(init));
                        }
                    }
                    Err(e) => tracing::warn!(err = %e, "could not serialize local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let track_slot = Arc::clone(&track_handler);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            tracing::debug!(kind = %track.kind(), id = %track.id(), "remote track received");
            if let Some(handler) = track_slot.lock().as_ref() {
                handler(RemoteMediaTrack { track });
            }
            Box::pin(async {})
        }));

        Self {
            pc,
            candidate_handler,
            track_handler,
            closed: AtomicBool::new(false),
        }
    }
}

impl PeerConnection for WebRtcPeer {
    type LocalTrack = SampleTrack;
    type RemoteTrack = RemoteMediaTrack;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| RtcError::new("create offer", e))?;
        from_rtc_description(&offer, "create offer")
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| RtcError::new("create answer", e))?;
        from_rtc_description(&answer, "create answer")
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        let description = to_rtc_description(description, "set local description")?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| RtcError::new("set local description", e))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let description = to_rtc_description(description, "set remote description")?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| RtcError::new("set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| RtcError::new("add ice candidate", e))
    }

    async fn add_track(&self, track: &SampleTrack) -> Result<(), RtcError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&track.track) as _;
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| RtcError::new("add track", e))?;

        // Drain RTCP so interceptors (NACK, reports) keep working.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    fn on_candidate(&self, handler: Option<CandidateHandler>) {
        *self.candidate_handler.lock() = handler;
    }

    fn on_track(&self, handler: Option<TrackHandler<RemoteMediaTrack>>) {
        *self.track_handler.lock() = handler;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available, peer connection left to drop");
            return;
        };
        let pc = Arc::clone(&self.pc);
        runtime.spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::warn!(err = %e, "peer connection close failed");
            }
        });
    }
}

/// Media engine with the default codecs and interceptors.
pub struct WebRtcBackend {
    api: API,
    capture_enabled: bool,
}

impl WebRtcBackend {
    /// Build the `webrtc` API.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError`] if codec or interceptor registration fails.
    pub fn new(capture_enabled: bool) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RtcError::new("register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| RtcError::new("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            capture_enabled,
        })
    }
}

impl RtcBackend for WebRtcBackend {
    type Peer = WebRtcPeer;

    async fn acquire_media(&self) -> Result<LocalMedia<SampleTrack>, MediaAccessError> {
        if !self.capture_enabled {
            return Err(MediaAccessError::NoDevices);
        }
        let audio = SampleTrack::audio();
        capture::start_microphone(audio.clone()).await?;
        Ok(LocalMedia::new(vec![audio]))
    }

    async fn create_peer(&self, ice_servers: &[IceServer]) -> Result<WebRtcPeer, RtcError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| RtcError::new("create peer connection", e))?;
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            }),
        )
        .await
        .map_err(|e| RtcError::new("add video transceiver", e))?;
        Ok(WebRtcPeer::new(Arc::new(pc)))
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(
    description: SessionDescription,
    operation: &'static str,
) -> Result<RTCSessionDescription, RtcError> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(RtcError::new(operation, "rollback is not supported"));
        }
    };
    result.map_err(|e| RtcError::new(operation, e))
}

fn from_rtc_description(
    description: &RTCSessionDescription,
    operation: &'static str,
) -> Result<SessionDescription, RtcError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::new(operation, "unspecified description type"));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
