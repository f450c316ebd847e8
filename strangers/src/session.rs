//! Session controller for `Strangers`.
//!
//! [`SessionController`] drives one client through the matching lifecycle
//! (`Idle -> Waiting -> Connected`), feeds inbound signaling events into the
//! [`ChatLog`], the [`TypingTracker`] and, for video sessions, the
//! [`NegotiationEngine`].
//!
//! The controller is a single actor: [`SessionController::next_input`]
//! waits for the next inbound item (a signaling event or a completion of
//! asynchronous negotiation work) and [`SessionController::handle_input`]
//! applies it. Items are applied one at a time, so no handler ever observes
//! another half-way through.

use std::fmt;

use serde::{Deserialize, Serialize};
use strangers_proto::signal::{SignalingEvent, normalize_keyword};
use tokio::sync::mpsc;

use crate::chat::{ChatLog, Message, TypingTracker};
use crate::negotiation::peer::{IceServer, LocalMedia, RemoteStream, RtcBackend};
use crate::negotiation::{
    EngineInput, EngineNotice, LocalTrackOf, NegotiationEngine, Phase, RemoteTrackOf,
};
use crate::signaling::{ChannelError, Identity, SignalingChannel};

/// Appended when a partner is found.
pub const CONNECTED_NOTICE: &str = "Connected to a stranger.";

/// Appended when the partner leaves.
pub const DISCONNECTED_NOTICE: &str = "Stranger disconnected.";

/// Appended (and immediately cleared) when the local user ends the chat.
pub const ENDED_NOTICE: &str = "You ended the chat.";

/// Appended when local capture fails in a video session.
pub const MEDIA_ERROR_NOTICE: &str = "Error accessing your camera/microphone.";

/// Appended when the subscription to the matchmaker ends.
pub const CONNECTION_LOST_NOTICE: &str = "Connection to the server was lost.";

/// Whether a session carries audio/video or only text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Chat only.
    #[default]
    Text,
    /// Chat plus a peer-to-peer audio/video connection.
    Video,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No active or pending session.
    Idle,
    /// A match was requested; no partner yet.
    Waiting,
    /// Paired with a partner.
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Waiting => write!(f, "waiting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// What the user asked to be matched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRequest {
    /// Text or video.
    pub mode: SessionMode,
    /// Normalised keyword (never blank).
    pub keyword: String,
}

/// Errors returned by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation is not permitted in the current state. Nothing was changed.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State at the time of the call.
        state: SessionState,
    },

    /// The signaling channel failed; the session was reset to idle.
    #[error("signaling failed: {0}")]
    Channel(#[from] ChannelError),
}

/// One inbound item for the controller.
pub enum ControllerInput<B: RtcBackend> {
    /// An event from the matchmaker.
    Signaling(SignalingEvent),
    /// The subscription ended: the connection to the matchmaker is gone.
    ChannelClosed,
    /// Asynchronous negotiation work completed.
    Negotiation(EngineInput<B>),
}

impl<B: RtcBackend> fmt::Debug for ControllerInput<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signaling(event) => f.debug_tuple("Signaling").field(event).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Negotiation(input) => f.debug_tuple("Negotiation").field(input).finish(),
        }
    }
}

/// The active (or pending) match.
#[derive(Debug)]
struct Session {
    request: MatchRequest,
    partner: Option<Identity>,
}

/// Top-level state machine of one client.
///
/// Owns the signaling channel: it subscribes on construction and
/// unsubscribes on drop. The subscription does not depend on the session
/// mode, so it is established exactly once.
pub struct SessionController<C: SignalingChannel, B: RtcBackend> {
    /// Connection to the matchmaker.
    channel: C,
    /// Inbound events of the subscription.
    events: mpsc::Receiver<SignalingEvent>,
    /// Cleared once the subscription ends.
    channel_open: bool,
    /// Peer connection negotiation for video sessions.
    engine: NegotiationEngine<B>,
    /// Lifecycle state.
    state: SessionState,
    /// The active or pending match, if any.
    session: Option<Session>,
    /// Most recent match request, kept for `next` after the session ends.
    last_request: Option<MatchRequest>,
    /// Messages of the current session.
    chat_log: ChatLog,
    /// Whether the partner is typing.
    typing: TypingTracker,
    /// Last `online_count` received.
    online_count: Option<u64>,
}

impl<C: SignalingChannel, B: RtcBackend> SessionController<C, B> {
    /// Create an idle controller and subscribe to `channel`.
    ///
    /// `ice_servers` configures every peer connection of video sessions.
    pub fn new(channel: C, backend: B, ice_servers: Vec<IceServer>) -> Self {
        let events = channel.subscribe();
        Self {
            channel,
            events,
            channel_open: true,
            engine: NegotiationEngine::new(backend, ice_servers),
            state: SessionState::Idle,
            session: None,
            last_request: None,
            chat_log: ChatLog::new(),
            typing: TypingTracker::new(),
            online_count: None,
        }
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    /// Ask the matchmaker for a stranger.
    ///
    /// Clears the chat log and the typing indicator and moves to `Waiting`.
    /// An empty keyword matches anyone.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless idle, and
    /// [`SessionError::Channel`] if the request could not be sent (the
    /// controller is then idle again).
    pub async fn request_match(
        &mut self,
        mode: SessionMode,
        keyword: &str,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "request a match",
                state: self.state,
            });
        }
        let request = MatchRequest {
            mode,
            keyword: normalize_keyword(keyword),
        };
        self.chat_log.clear();
        self.typing.reset();
        self.enter_waiting(request).await
    }

    /// Drop the current partner (or queue slot) and look for a new one.
    ///
    /// Re-uses the mode and keyword of the current or most recent request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] if no match was ever requested,
    /// and [`SessionError::Channel`] if the request could not be sent.
    pub async fn next(&mut self) -> Result<(), SessionError> {
        let Some(request) = self
            .session
            .as_ref()
            .map(|s| s.request.clone())
            .or_else(|| self.last_request.clone())
        else {
            return Err(SessionError::InvalidState {
                operation: "skip to the next stranger",
                state: self.state,
            });
        };
        self.engine.teardown();
        self.chat_log.clear();
        self.typing.reset();
        self.enter_waiting(request).await
    }

    /// End the current session and return to idle.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if the matchmaker could not be told
    /// about it. The local session is ended regardless and the log stays
    /// empty.
    pub async fn end(&mut self) -> Result<(), SessionError> {
        let was_active = self.state != SessionState::Idle;
        self.chat_log.push(Message::system(ENDED_NOTICE));
        self.engine.teardown();
        self.chat_log.clear();
        self.typing.reset();
        self.session = None;
        self.state = SessionState::Idle;
        tracing::info!(was_active, "session ended by user");

        if was_active {
            if let Err(e) = self.channel.send_leave().await {
                tracing::warn!(error = %e, "could not announce departure");
                return Err(SessionError::Channel(e));
            }
        }
        Ok(())
    }

    /// Send a chat line to the partner.
    ///
    /// Ignored unless connected, and for blank text.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if the message could not be sent.
    pub async fn send_message(&mut self, text: &str) -> Result<(), SessionError> {
        let Some(partner) = self.connected_partner() else {
            tracing::debug!(state = %self.state, "not connected, message dropped");
            return Ok(());
        };
        if text.trim().is_empty() {
            return Ok(());
        }
        self.chat_log.push(Message::you(text));
        self.typing.reset();

        let sent = self.channel.send_chat_message(&partner, text).await;
        self.check_sent(sent)?;
        let sent = self.channel.send_stop_typing(&partner).await;
        self.check_sent(sent)
    }

    /// Tell the partner the local user is typing. Ignored unless connected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if the notification could not be sent.
    pub async fn notify_typing(&mut self) -> Result<(), SessionError> {
        let Some(partner) = self.connected_partner() else {
            return Ok(());
        };
        let sent = self.channel.send_typing(&partner).await;
        self.check_sent(sent)
    }

    /// Tell the partner the local user stopped typing. Ignored unless connected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if the notification could not be sent.
    pub async fn notify_stop_typing(&mut self) -> Result<(), SessionError> {
        let Some(partner) = self.connected_partner() else {
            return Ok(());
        };
        let sent = self.channel.send_stop_typing(&partner).await;
        self.check_sent(sent)
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    /// Wait for the next inbound item.
    ///
    /// Once the subscription has ended only negotiation completions are
    /// returned.
    pub async fn next_input(&mut self) -> ControllerInput<B> {
        tokio::select! {
            event = self.events.recv(), if self.channel_open => match event {
                Some(event) => ControllerInput::Signaling(event),
                None => ControllerInput::ChannelClosed,
            },
            input = self.engine.next_input() => ControllerInput::Negotiation(input),
        }
    }

    /// Apply one inbound item.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if a reply (a negotiation
    /// description or candidate) could not be relayed. The session has
    /// already been reset to idle when this is returned.
    pub async fn handle_input(&mut self, input: ControllerInput<B>) -> Result<(), SessionError> {
        match input {
            ControllerInput::Signaling(event) => {
                self.handle_event(event);
                Ok(())
            }
            ControllerInput::ChannelClosed => {
                self.channel_open = false;
                tracing::warn!("signaling subscription ended");
                self.fail_channel(&ChannelError::Closed);
                Ok(())
            }
            ControllerInput::Negotiation(input) => {
                let result = self.engine.handle_input(input, &self.channel).await;
                match result {
                    Ok(notice) => {
                        self.apply_notice(notice);
                        Ok(())
                    }
                    Err(e) => {
                        self.fail_channel(&e);
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Wait for the next inbound item and apply it.
    ///
    /// # Errors
    ///
    /// See [`SessionController::handle_input`].
    pub async fn process_next(&mut self) -> Result<(), SessionError> {
        let input = self.next_input().await;
        self.handle_input(input).await
    }

    fn handle_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Welcome { id } => {
                tracing::debug!(identity = %id, "welcome received");
            }
            SignalingEvent::OnlineCount(count) => {
                self.online_count = Some(count);
            }
            SignalingEvent::Matched(partner) => self.on_matched(Identity::new(partner)),
            SignalingEvent::ReceiveMessage { from, text } => {
                if self.state != SessionState::Connected {
                    tracing::debug!(state = %self.state, "message outside a session, dropping");
                    return;
                }
                let from_self = self
                    .channel
                    .local_identity()
                    .is_some_and(|local| local.as_str() == from);
                if from_self {
                    self.chat_log.push(Message::you(text));
                } else {
                    self.chat_log.push(Message::stranger(text));
                }
            }
            SignalingEvent::PartnerDisconnected => {
                if self.state != SessionState::Connected {
                    tracing::debug!(state = %self.state, "stale partner_disconnected, ignoring");
                    return;
                }
                tracing::info!(partner = ?self.partner(), "partner disconnected");
                self.chat_log.push(Message::system(DISCONNECTED_NOTICE));
                self.engine.teardown();
                self.typing.reset();
                self.session = None;
                self.state = SessionState::Idle;
            }
            SignalingEvent::StrangerTyping => {
                if self.state == SessionState::Connected {
                    self.typing.set_typing();
                }
            }
            SignalingEvent::StrangerStopTyping => {
                if self.state == SessionState::Connected {
                    self.typing.set_stopped();
                }
            }
            SignalingEvent::WebrtcSignal { from, data } => {
                let from_partner = self
                    .connected_partner()
                    .is_some_and(|partner| partner.as_str() == from);
                if !from_partner {
                    tracing::warn!(from = %from, "negotiation payload not from the partner, dropping");
                    return;
                }
                let notice = self.engine.handle_payload(data);
                self.apply_notice(notice);
            }
            SignalingEvent::Error { reason } => {
                tracing::warn!(reason = %reason, "matchmaker reported an error");
            }
        }
    }

    fn on_matched(&mut self, partner: Identity) {
        if self.state != SessionState::Waiting {
            tracing::warn!(partner = %partner, state = %self.state, "unexpected match, ignoring");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        tracing::info!(partner = %partner, mode = %session.request.mode, "matched");
        session.partner = Some(partner.clone());
        let mode = session.request.mode;
        self.chat_log.push(Message::system(CONNECTED_NOTICE));
        self.state = SessionState::Connected;

        if mode == SessionMode::Video {
            match self.channel.local_identity() {
                Some(local) => self.engine.begin(&local, &partner),
                None => tracing::warn!("no local identity, continuing without video"),
            }
        }
    }

    fn apply_notice(&mut self, notice: Option<EngineNotice>) {
        match notice {
            Some(EngineNotice::MediaUnavailable(e)) => {
                tracing::warn!(error = %e, "continuing without video");
                self.chat_log.push(Message::system(MEDIA_ERROR_NOTICE));
            }
            Some(EngineNotice::LocalMediaReady) => tracing::debug!("local media attached"),
            Some(EngineNotice::RemoteStreamUpdated) => tracing::debug!("remote stream updated"),
            Some(EngineNotice::Aborted(e)) => {
                tracing::debug!(error = %e, "negotiation ended, chat continues");
            }
            None => {}
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn enter_waiting(&mut self, request: MatchRequest) -> Result<(), SessionError> {
        tracing::info!(mode = %request.mode, keyword = %request.keyword, "looking for a stranger");
        let keyword = request.keyword.clone();
        self.last_request = Some(request.clone());
        self.session = Some(Session {
            request,
            partner: None,
        });
        self.state = SessionState::Waiting;
        let sent = self.channel.send_find_match(&keyword).await;
        self.check_sent(sent)
    }

    fn connected_partner(&self) -> Option<Identity> {
        if self.state != SessionState::Connected {
            return None;
        }
        self.session.as_ref()?.partner.clone()
    }

    fn check_sent(&mut self, result: Result<(), ChannelError>) -> Result<(), SessionError> {
        result.map_err(|e| {
            self.fail_channel(&e);
            SessionError::Channel(e)
        })
    }

    /// Reset to idle after a signaling failure, leaving a notice in the log.
    fn fail_channel(&mut self, error: &ChannelError) {
        tracing::warn!(error = %error, state = %self.state, "signaling failure");
        let notice = match error {
            ChannelError::Closed => CONNECTION_LOST_NOTICE.to_string(),
            other => format!("Could not reach the server: {other}"),
        };
        self.chat_log.push(Message::system(notice));
        self.engine.teardown();
        self.typing.reset();
        self.session = None;
        self.state = SessionState::Idle;
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Mode of the active or pending session.
    #[must_use]
    pub fn mode(&self) -> Option<SessionMode> {
        self.session.as_ref().map(|s| s.request.mode)
    }

    /// Keyword of the active or pending session.
    #[must_use]
    pub fn keyword(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.request.keyword.as_str())
    }

    #[must_use]
    pub fn partner(&self) -> Option<&Identity> {
        self.session.as_ref()?.partner.as_ref()
    }

    #[must_use]
    pub const fn chat_log(&self) -> &ChatLog {
        &self.chat_log
    }

    #[must_use]
    pub const fn is_stranger_typing(&self) -> bool {
        self.typing.is_typing()
    }

    /// Last number of connected users reported by the matchmaker.
    #[must_use]
    pub const fn online_count(&self) -> Option<u64> {
        self.online_count
    }

    #[must_use]
    pub fn local_identity(&self) -> Option<Identity> {
        self.channel.local_identity()
    }

    #[must_use]
    pub fn local_media(&self) -> Option<&LocalMedia<LocalTrackOf<B>>> {
        self.engine.local_media()
    }

    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream<RemoteTrackOf<B>>> {
        self.engine.remote_stream()
    }

    /// Description-exchange phase of the live negotiation.
    #[must_use]
    pub fn negotiation_phase(&self) -> Option<Phase> {
        self.engine.phase()
    }

    /// Whether the subscription to the matchmaker is still live.
    #[must_use]
    pub const fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }
}

impl<C: SignalingChannel, B: RtcBackend> Drop for SessionController<C, B> {
    fn drop(&mut self) {
        self.engine.teardown();
        self.channel.unsubscribe();
    }
}
