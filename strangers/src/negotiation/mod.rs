//! Peer connection negotiation for video sessions.
//!
//! [`NegotiationEngine`] owns at most one live negotiation. Every attempt
//! gets a fresh generation id; asynchronous work (media acquisition and the
//! description steps) runs on spawned tasks that report back through the
//! engine's input queue tagged with that id. The owner feeds those inputs
//! back via [`NegotiationEngine::handle_input`], and anything tagged with a
//! superseded generation is discarded and its resources released.
//!
//! Inbound payloads are applied strictly in arrival order with at most one
//! description step in flight. Remote candidates wait until a remote
//! description is applied; local candidates wait until our own description
//! has been relayed.

mod capture;
pub mod peer;
pub mod rtc;
pub mod stub;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use strangers_proto::codec::CodecError;
use strangers_proto::negotiation::{IceCandidate, NegotiationPayload, SdpType, SessionDescription};
use tokio::sync::mpsc;

use crate::signaling::{ChannelError, Identity, SignalingChannel};

use self::peer::{
    IceServer, LocalMedia, MediaAccessError, PeerConnection, RemoteStream, RtcBackend, RtcError,
};

/// Local track type of a backend.
pub type LocalTrackOf<B> = <<B as RtcBackend>::Peer as PeerConnection>::LocalTrack;

/// Remote track type of a backend.
pub type RemoteTrackOf<B> = <<B as RtcBackend>::Peer as PeerConnection>::RemoteTrack;

/// Which side of a match creates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the one offer of the session.
    Initiator,
    /// Waits for the offer and answers it.
    Responder,
}

impl Role {
    /// The side whose identity sorts strictly first initiates.
    #[must_use]
    pub fn assign(local: &Identity, partner: &Identity) -> Self {
        if local < partner {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

/// Description-exchange phase of the live negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Acquiring media and creating the connection.
    Opening,
    /// Responder: waiting for the partner's offer.
    AwaitingOffer,
    /// Initiator: offer relayed, waiting for the answer.
    AwaitingAnswer,
    /// Responder: applying the offer and producing the answer.
    Answering,
    /// Both descriptions applied.
    Stable,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::AwaitingOffer => "awaiting offer",
            Self::AwaitingAnswer => "awaiting answer",
            Self::Answering => "answering",
            Self::Stable => "stable",
        };
        f.write_str(name)
    }
}

/// Errors that end a negotiation attempt. None of them affect the chat.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// Local capture could not be started.
    #[error("media unavailable: {0}")]
    Media(#[from] MediaAccessError),

    /// The partner sent something that is not a negotiation payload.
    #[error("malformed negotiation payload: {0}")]
    Malformed(#[from] CodecError),

    /// A description arrived that the current role and phase do not expect.
    #[error("unexpected {kind} while {phase}")]
    UnexpectedDescription {
        /// Kind of the offending description.
        kind: SdpType,
        /// Phase it arrived in.
        phase: Phase,
    },

    /// A peer connection operation failed.
    #[error(transparent)]
    Rtc(#[from] RtcError),

    /// The attempt was torn down while the operation was in flight.
    #[error("negotiation superseded")]
    Superseded,
}

/// Something the session layer may want to react to.
#[derive(Debug)]
pub enum EngineNotice {
    /// Capture failed; the session continues without media.
    MediaUnavailable(MediaAccessError),
    /// Local tracks are attached to the connection.
    LocalMediaReady,
    /// A remote track was added to the remote stream.
    RemoteStreamUpdated,
    /// The attempt failed and was torn down.
    Aborted(NegotiationError),
}

/// Completion of asynchronous engine work, tagged with its generation.
pub struct EngineInput<B: RtcBackend> {
    generation: u64,
    kind: InputKind<B>,
}

impl<B: RtcBackend> EngineInput<B> {
    /// Generation of the attempt this input belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

impl<B: RtcBackend> fmt::Debug for EngineInput<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            InputKind::Opened(Ok(_)) => "opened",
            InputKind::Opened(Err(_)) => "open failed",
            InputKind::StepFinished(_) => "step finished",
            InputKind::LocalCandidate(_) => "local candidate",
            InputKind::RemoteTrack(_) => "remote track",
        };
        f.debug_struct("EngineInput")
            .field("generation", &self.generation)
            .field("kind", &kind)
            .finish()
    }
}

enum InputKind<B: RtcBackend> {
    Opened(Result<Opened<B>, NegotiationError>),
    StepFinished(Result<StepOutput, NegotiationError>),
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrackOf<B>),
}

/// Resources produced by the opening sequence.
struct Opened<B: RtcBackend> {
    peer: Arc<B::Peer>,
    media: LocalMedia<LocalTrackOf<B>>,
    offer: Option<SessionDescription>,
}

impl<B: RtcBackend> Opened<B> {
    fn release(self) {
        release(&*self.peer, &self.media);
    }
}

fn release<P: PeerConnection>(peer: &P, media: &LocalMedia<P::LocalTrack>) {
    peer.on_candidate(None);
    peer.on_track(None);
    peer.close();
    media.stop();
}

enum StepOutput {
    /// Remote offer applied, answer created and set locally.
    Answered(SessionDescription),
    /// Remote answer applied.
    AnswerApplied,
    CandidateApplied,
    CandidateRejected(RtcError),
}

/// Shared view of the engine's generation counter, captured by tasks.
#[derive(Clone)]
struct GenerationGuard {
    counter: Arc<AtomicU64>,
    generation: u64,
}

impl GenerationGuard {
    fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.generation
    }

    fn check(&self) -> Result<(), NegotiationError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(NegotiationError::Superseded)
        }
    }
}

struct Negotiation<B: RtcBackend> {
    generation: u64,
    partner: Identity,
    role: Role,
    phase: Phase,
    peer: Option<Arc<B::Peer>>,
    local_media: Option<LocalMedia<LocalTrackOf<B>>>,
    remote_stream: Option<RemoteStream<RemoteTrackOf<B>>>,
    inbox: VecDeque<NegotiationPayload>,
    step_in_flight: bool,
    remote_description_set: bool,
    pending_remote_candidates: Vec<IceCandidate>,
    local_description_sent: bool,
    pending_local_candidates: Vec<IceCandidate>,
}

impl<B: RtcBackend> Negotiation<B> {
    fn new(generation: u64, partner: Identity, role: Role) -> Self {
        Self {
            generation,
            partner,
            role,
            phase: Phase::Opening,
            peer: None,
            local_media: None,
            remote_stream: None,
            inbox: VecDeque::new(),
            step_in_flight: false,
            remote_description_set: false,
            pending_remote_candidates: Vec::new(),
            local_description_sent: false,
            pending_local_candidates: Vec::new(),
        }
    }

    /// Put held remote candidates back at the front of the inbox, ahead of
    /// anything that arrived after them.
    fn requeue_remote_candidates(&mut self) {
        for candidate in self.pending_remote_candidates.drain(..).rev() {
            self.inbox
                .push_front(NegotiationPayload::Candidate { candidate });
        }
    }
}

/// Owns the peer connection lifecycle of video sessions.
pub struct NegotiationEngine<B: RtcBackend> {
    backend: Arc<B>,
    ice_servers: Arc<[IceServer]>,
    generation: Arc<AtomicU64>,
    current: Option<Negotiation<B>>,
    inputs_tx: mpsc::UnboundedSender<EngineInput<B>>,
    inputs_rx: mpsc::UnboundedReceiver<EngineInput<B>>,
}

impl<B: RtcBackend> NegotiationEngine<B> {
    /// Create an idle engine that will configure connections with `ice_servers`.
    pub fn new(backend: B, ice_servers: Vec<IceServer>) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        Self {
            backend: Arc::new(backend),
            ice_servers: ice_servers.into(),
            generation: Arc::new(AtomicU64::new(0)),
            current: None,
            inputs_tx,
            inputs_rx,
        }
    }

    /// Start negotiating with `partner`, replacing any live negotiation.
    ///
    /// Returns immediately; the opening sequence (capture, connection,
    /// handlers, tracks and, for the initiator, the offer) runs on a spawned
    /// task. Must be called from within a Tokio runtime.
    pub fn begin(&mut self, local: &Identity, partner: &Identity) {
        self.teardown();
        let generation = self.generation.load(Ordering::SeqCst);
        let role = Role::assign(local, partner);
        tracing::info!(partner = %partner, ?role, generation, "starting negotiation");

        self.current = Some(Negotiation::new(generation, partner.clone(), role));

        let guard = GenerationGuard {
            counter: Arc::clone(&self.generation),
            generation,
        };
        tokio::spawn(open_connection(
            Arc::clone(&self.backend),
            Arc::clone(&self.ice_servers),
            role,
            guard,
            self.inputs_tx.clone(),
        ));
    }

    /// Tear down the live negotiation, if any. Idempotent.
    ///
    /// Bumps the generation so in-flight work is discarded, detaches the
    /// handlers, closes the connection, stops local tracks and drops the
    /// remote stream.
    pub fn teardown(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(negotiation) = self.current.take() else {
            return;
        };
        tracing::debug!(
            partner = %negotiation.partner,
            generation = negotiation.generation,
            phase = %negotiation.phase,
            "tearing down negotiation"
        );
        if let Some(peer) = &negotiation.peer {
            peer.on_candidate(None);
            peer.on_track(None);
            peer.close();
        }
        if let Some(media) = &negotiation.local_media {
            media.stop();
        }
    }

    /// Wait for the next completion of asynchronous engine work.
    pub async fn next_input(&mut self) -> EngineInput<B> {
        match self.inputs_rx.recv().await {
            Some(input) => input,
            // The engine holds a sender, so the queue never closes.
            None => std::future::pending().await,
        }
    }

    /// Accept a negotiation payload from the partner.
    ///
    /// Payloads with no live negotiation are dropped. Malformed payloads
    /// abort the attempt.
    pub fn handle_payload(&mut self, data: serde_json::Value) -> Option<EngineNotice> {
        let Some(negotiation) = self.current.as_mut() else {
            tracing::warn!("negotiation payload with no live negotiation, dropping");
            return None;
        };
        match NegotiationPayload::from_value(data) {
            Ok(payload) => {
                negotiation.inbox.push_back(payload);
                self.pump()
            }
            Err(e) => Some(self.abort(e.into())),
        }
    }

    /// Apply a completion produced by [`NegotiationEngine::next_input`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if relaying a description or candidate to the
    /// partner fails. The negotiation itself is left as is; the caller decides
    /// whether to tear it down.
    pub async fn handle_input<C: SignalingChannel>(
        &mut self,
        input: EngineInput<B>,
        channel: &C,
    ) -> Result<Option<EngineNotice>, ChannelError> {
        let EngineInput { generation, kind } = input;
        if !self
            .current
            .as_ref()
            .is_some_and(|n| n.generation == generation)
        {
            tracing::debug!(generation, "discarding stale negotiation input");
            if let InputKind::Opened(Ok(opened)) = kind {
                opened.release();
            }
            return Ok(None);
        }

        match kind {
            InputKind::Opened(Ok(opened)) => self.on_opened(opened, channel).await,
            InputKind::Opened(Err(NegotiationError::Media(e))) => {
                tracing::warn!(error = %e, "media acquisition failed");
                self.teardown();
                Ok(Some(EngineNotice::MediaUnavailable(e)))
            }
            InputKind::Opened(Err(e)) => Ok(Some(self.abort(e))),
            InputKind::StepFinished(result) => self.on_step_finished(result, channel).await,
            InputKind::LocalCandidate(candidate) => {
                self.on_local_candidate(candidate, channel).await?;
                Ok(None)
            }
            InputKind::RemoteTrack(track) => {
                if let Some(negotiation) = self.current.as_mut() {
                    negotiation
                        .remote_stream
                        .get_or_insert_with(RemoteStream::default)
                        .push(track);
                }
                Ok(Some(EngineNotice::RemoteStreamUpdated))
            }
        }
    }

    /// Whether a negotiation is live.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.current.is_some()
    }

    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.current.as_ref().map(|n| n.phase)
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.current.as_ref().map(|n| n.role)
    }

    /// Current generation id; bumped by every `begin` and `teardown`.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn local_media(&self) -> Option<&LocalMedia<LocalTrackOf<B>>> {
        self.current.as_ref()?.local_media.as_ref()
    }

    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream<RemoteTrackOf<B>>> {
        self.current.as_ref()?.remote_stream.as_ref()
    }

    // ---- Internals ----

    fn guard(&self, generation: u64) -> GenerationGuard {
        GenerationGuard {
            counter: Arc::clone(&self.generation),
            generation,
        }
    }

    fn abort(&mut self, error: NegotiationError) -> EngineNotice {
        tracing::warn!(error = %error, "negotiation aborted");
        self.teardown();
        EngineNotice::Aborted(error)
    }

    async fn on_opened<C: SignalingChannel>(
        &mut self,
        opened: Opened<B>,
        channel: &C,
    ) -> Result<Option<EngineNotice>, ChannelError> {
        let Some(negotiation) = self.current.as_mut() else {
            opened.release();
            return Ok(None);
        };
        let Opened { peer, media, offer } = opened;
        negotiation.peer = Some(peer);
        negotiation.local_media = Some(media);

        if let Some(offer) = offer {
            negotiation.phase = Phase::AwaitingAnswer;
            let partner = negotiation.partner.clone();
            tracing::debug!(partner = %partner, "relaying offer");
            channel
                .send_negotiation_payload(&partner, &NegotiationPayload::Description(offer))
                .await?;
            self.flush_local_candidates(channel).await?;
        } else {
            negotiation.phase = Phase::AwaitingOffer;
        }

        // Payloads that arrived while opening are applied now.
        if let Some(notice) = self.pump() {
            return Ok(Some(notice));
        }
        Ok(Some(EngineNotice::LocalMediaReady))
    }

    async fn on_step_finished<C: SignalingChannel>(
        &mut self,
        result: Result<StepOutput, NegotiationError>,
        channel: &C,
    ) -> Result<Option<EngineNotice>, ChannelError> {
        let output = match result {
            Ok(output) => output,
            Err(e) => return Ok(Some(self.abort(e))),
        };
        let Some(negotiation) = self.current.as_mut() else {
            return Ok(None);
        };
        negotiation.step_in_flight = false;

        match output {
            StepOutput::Answered(answer) => {
                negotiation.remote_description_set = true;
                negotiation.phase = Phase::Stable;
                negotiation.requeue_remote_candidates();
                let partner = negotiation.partner.clone();
                tracing::debug!(partner = %partner, "relaying answer");
                channel
                    .send_negotiation_payload(&partner, &NegotiationPayload::Description(answer))
                    .await?;
                self.flush_local_candidates(channel).await?;
            }
            StepOutput::AnswerApplied => {
                negotiation.remote_description_set = true;
                negotiation.phase = Phase::Stable;
                negotiation.requeue_remote_candidates();
                tracing::debug!(partner = %negotiation.partner, "negotiation stable");
            }
            StepOutput::CandidateApplied => {}
            StepOutput::CandidateRejected(e) => {
                tracing::warn!(error = %e, "remote candidate rejected, skipping");
            }
        }
        Ok(self.pump())
    }

    async fn on_local_candidate<C: SignalingChannel>(
        &mut self,
        candidate: IceCandidate,
        channel: &C,
    ) -> Result<(), ChannelError> {
        let Some(negotiation) = self.current.as_mut() else {
            return Ok(());
        };
        if !negotiation.local_description_sent {
            negotiation.pending_local_candidates.push(candidate);
            return Ok(());
        }
        let partner = negotiation.partner.clone();
        channel
            .send_negotiation_payload(&partner, &NegotiationPayload::Candidate { candidate })
            .await
    }

    /// Mark our description as relayed and relay the candidates held until now.
    async fn flush_local_candidates<C: SignalingChannel>(
        &mut self,
        channel: &C,
    ) -> Result<(), ChannelError> {
        let Some(negotiation) = self.current.as_mut() else {
            return Ok(());
        };
        negotiation.local_description_sent = true;
        let partner = negotiation.partner.clone();
        let held = std::mem::take(&mut negotiation.pending_local_candidates);
        for candidate in held {
            channel
                .send_negotiation_payload(&partner, &NegotiationPayload::Candidate { candidate })
                .await?;
        }
        Ok(())
    }

    /// Start the next inbox step unless one is in flight or the connection
    /// does not exist yet.
    fn pump(&mut self) -> Option<EngineNotice> {
        let guard = self.guard(self.current.as_ref()?.generation);
        let negotiation = self.current.as_mut()?;
        if negotiation.step_in_flight {
            return None;
        }
        let peer = Arc::clone(negotiation.peer.as_ref()?);

        while let Some(payload) = negotiation.inbox.pop_front() {
            match payload {
                NegotiationPayload::Candidate { candidate } => {
                    if !negotiation.remote_description_set {
                        negotiation.pending_remote_candidates.push(candidate);
                        continue;
                    }
                    negotiation.step_in_flight = true;
                    self.spawn_step(guard, add_candidate(peer, candidate));
                    return None;
                }
                NegotiationPayload::Description(description) => {
                    match (negotiation.role, negotiation.phase, description.kind) {
                        (Role::Responder, Phase::AwaitingOffer, SdpType::Offer) => {
                            negotiation.phase = Phase::Answering;
                            negotiation.step_in_flight = true;
                            self.spawn_step(guard.clone(), answer_offer(peer, description, guard));
                        }
                        (Role::Initiator, Phase::AwaitingAnswer, SdpType::Answer) => {
                            negotiation.step_in_flight = true;
                            self.spawn_step(guard, apply_answer(peer, description));
                        }
                        (_, phase, kind) => {
                            return Some(
                                self.abort(NegotiationError::UnexpectedDescription { kind, phase }),
                            );
                        }
                    }
                    return None;
                }
            }
        }
        None
    }

    fn spawn_step<F>(&self, guard: GenerationGuard, step: F)
    where
        F: std::future::Future<Output = Result<StepOutput, NegotiationError>> + Send + 'static,
    {
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = step.await;
            let _ = inputs.send(EngineInput {
                generation: guard.generation,
                kind: InputKind::StepFinished(result),
            });
        });
    }
}

impl<B: RtcBackend> Drop for NegotiationEngine<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ---------------------------------------------------------------------------
// Spawned work
// ---------------------------------------------------------------------------

/// Opening sequence; always reports back, even when superseded.
async fn open_connection<B: RtcBackend>(
    backend: Arc<B>,
    ice_servers: Arc<[IceServer]>,
    role: Role,
    guard: GenerationGuard,
    inputs: mpsc::UnboundedSender<EngineInput<B>>,
) {
    let result = open_steps(&*backend, &ice_servers, role, &guard, &inputs).await;
    let _ = inputs.send(EngineInput {
        generation: guard.generation,
        kind: InputKind::Opened(result),
    });
}

async fn open_steps<B: RtcBackend>(
    backend: &B,
    ice_servers: &[IceServer],
    role: Role,
    guard: &GenerationGuard,
    inputs: &mpsc::UnboundedSender<EngineInput<B>>,
) -> Result<Opened<B>, NegotiationError> {
    let media = backend.acquire_media().await?;
    if !guard.is_current() {
        media.stop();
        return Err(NegotiationError::Superseded);
    }

    let peer = match backend.create_peer(ice_servers).await {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            media.stop();
            return Err(e.into());
        }
    };

    let mut opened = Opened {
        peer,
        media,
        offer: None,
    };
    match prepare_peer(&mut opened, role, guard, inputs).await {
        Ok(()) => Ok(opened),
        Err(e) => {
            opened.release();
            Err(e)
        }
    }
}

async fn prepare_peer<B: RtcBackend>(
    opened: &mut Opened<B>,
    role: Role,
    guard: &GenerationGuard,
    inputs: &mpsc::UnboundedSender<EngineInput<B>>,
) -> Result<(), NegotiationError> {
    guard.check()?;
    let generation = guard.generation;

    let candidates = inputs.clone();
    opened.peer.on_candidate(Some(Box::new(move |candidate| {
        let _ = candidates.send(EngineInput {
            generation,
            kind: InputKind::LocalCandidate(candidate),
        });
    })));
    let tracks = inputs.clone();
    opened.peer.on_track(Some(Box::new(move |track| {
        let _ = tracks.send(EngineInput {
            generation,
            kind: InputKind::RemoteTrack(track),
        });
    })));

    for track in opened.media.tracks() {
        opened.peer.add_track(track).await?;
    }
    guard.check()?;

    if role == Role::Initiator {
        let offer = opened.peer.create_offer().await?;
        guard.check()?;
        opened.peer.set_local_description(offer.clone()).await?;
        guard.check()?;
        opened.offer = Some(offer);
    }
    Ok(())
}

async fn answer_offer<P: PeerConnection>(
    peer: Arc<P>,
    offer: SessionDescription,
    guard: GenerationGuard,
) -> Result<StepOutput, NegotiationError> {
    peer.set_remote_description(offer).await?;
    guard.check()?;
    let answer = peer.create_answer().await?;
    guard.check()?;
    peer.set_local_description(answer.clone()).await?;
    Ok(StepOutput::Answered(answer))
}

async fn apply_answer<P: PeerConnection>(
    peer: Arc<P>,
    answer: SessionDescription,
) -> Result<StepOutput, NegotiationError> {
    peer.set_remote_description(answer).await?;
    Ok(StepOutput::AnswerApplied)
}

async fn add_candidate<P: PeerConnection>(
    peer: Arc<P>,
    candidate: IceCandidate,
) -> Result<StepOutput, NegotiationError> {
    Ok(match peer.add_ice_candidate(candidate).await {
        Ok(()) => StepOutput::CandidateApplied,
        Err(e) => StepOutput::CandidateRejected(e),
    })
}
