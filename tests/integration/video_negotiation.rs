//! Integration tests for video sessions: role assignment, offer/answer
//! exchange, candidate ordering and teardown, driven through the session
//! controller against a loopback matchmaker and the recording RTC backend.
//!
//! Verification command: `cargo test --test video_negotiation`

use std::time::Duration;

use serde_json::json;
use strangers::chat::Message;
use strangers::negotiation::Phase;
use strangers::negotiation::peer::{IceServer, MediaAccessError, MediaKind};
use strangers::negotiation::stub::{PeerCall, StubBackend, StubTrack};
use strangers::session::{MEDIA_ERROR_NOTICE, SessionController, SessionMode, SessionState};
use strangers::signaling::Identity;
use strangers::signaling::loopback::{LoopbackChannel, LoopbackHandle};
use strangers_proto::negotiation::{IceCandidate, NegotiationPayload, SdpType, SessionDescription};
use strangers_proto::signal::{SignalingEvent, SignalingRequest};

type Controller = SessionController<LoopbackChannel, StubBackend>;

// =============================================================================
// Test helpers
// =============================================================================

fn stun() -> IceServer {
    IceServer::stun("stun:stun.example.org:3478")
}

fn setup(local: &str, backend: &StubBackend) -> (Controller, LoopbackHandle) {
    let (channel, handle) = LoopbackChannel::new(Identity::new(local));
    let controller = SessionController::new(channel, backend.clone(), vec![stun()]);
    (controller, handle)
}

/// Apply inbound items until `done` holds, failing after five seconds.
async fn drive_until<F>(controller: &mut Controller, mut done: F)
where
    F: FnMut(&Controller) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(controller) {
        tokio::time::timeout_at(deadline, controller.process_next())
            .await
            .expect("session made no progress")
            .unwrap();
    }
}

/// Request a video match and pair with `partner`, stopping once the opening
/// sequence has settled into `phase`.
async fn match_video(
    controller: &mut Controller,
    handle: &mut LoopbackHandle,
    partner: &str,
    phase: Phase,
) {
    controller
        .request_match(SessionMode::Video, "")
        .await
        .unwrap();
    assert!(handle.inject(SignalingEvent::Matched(partner.into())).await);
    drive_until(controller, |c| c.negotiation_phase() == Some(phase)).await;
}

/// Negotiation payloads sent so far, with their recipient.
fn sent_payloads(handle: &mut LoopbackHandle) -> Vec<(String, NegotiationPayload)> {
    handle
        .sent()
        .into_iter()
        .filter_map(|request| match request {
            SignalingRequest::WebrtcSignal { to, data } => {
                Some((to, NegotiationPayload::from_value(data).unwrap()))
            }
            _ => None,
        })
        .collect()
}

fn signal(from: &str, data: serde_json::Value) -> SignalingEvent {
    SignalingEvent::WebrtcSignal {
        from: from.into(),
        data,
    }
}

fn candidate(line: &str) -> IceCandidate {
    IceCandidate {
        candidate: line.to_string(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

/// Inject a marker event and apply everything up to it, so that whatever was
/// injected before it has been handled.
async fn settle(controller: &mut Controller, handle: &LoopbackHandle, marker: u64) {
    assert!(handle.inject(SignalingEvent::OnlineCount(marker)).await);
    drive_until(controller, |c| c.online_count() == Some(marker)).await;
}

// =============================================================================
// Initiator
// =============================================================================

#[tokio::test]
async fn initiator_sends_one_offer_and_completes() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);

    controller
        .request_match(SessionMode::Video, "")
        .await
        .unwrap();
    assert_eq!(
        handle.sent(),
        vec![SignalingRequest::FindStranger {
            keyword: "random".into()
        }]
    );

    assert!(handle.inject(SignalingEvent::Matched("p1".into())).await);
    drive_until(&mut controller, |c| {
        c.negotiation_phase() == Some(Phase::AwaitingAnswer)
    })
    .await;

    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(
        sent_payloads(&mut handle),
        vec![(
            "p1".to_string(),
            NegotiationPayload::Description(SessionDescription::offer("stub-offer-0"))
        )]
    );
    let peer = backend.last_peer().unwrap();
    assert_eq!(peer.offers_created(), 1);
    let media = controller.local_media().unwrap();
    assert!(media.has(MediaKind::Audio));
    assert!(media.has(MediaKind::Video));

    assert!(
        handle
            .inject(signal("p1", json!({"type": "answer", "sdp": "remote-answer"})))
            .await
    );
    drive_until(&mut controller, |c| {
        c.negotiation_phase() == Some(Phase::Stable)
    })
    .await;

    assert_eq!(peer.offers_created(), 1);
    assert_eq!(
        peer.calls().last(),
        Some(&PeerCall::SetRemote(SdpType::Answer))
    );
}

#[tokio::test]
async fn connection_uses_configured_ice_servers() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;

    assert_eq!(backend.ice_servers_seen(), vec![vec![stun()]]);
}

#[tokio::test]
async fn local_candidates_follow_the_offer() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;
    handle.sent();

    let peer = backend.last_peer().unwrap();
    assert!(peer.emit_candidate(candidate("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host")));
    tokio::time::timeout(Duration::from_secs(5), controller.process_next())
        .await
        .expect("candidate was not relayed")
        .unwrap();

    match sent_payloads(&mut handle).as_slice() {
        [(to, NegotiationPayload::Candidate { candidate })] => {
            assert_eq!(to, "p1");
            assert!(candidate.candidate.contains("10.0.0.1"));
        }
        other => panic!("expected one candidate payload, got {other:?}"),
    }
}

#[tokio::test]
async fn remote_candidates_wait_for_the_answer() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;
    let peer = backend.last_peer().unwrap();

    let early = candidate("candidate:1 1 udp 1 10.0.0.2 5000 typ host");
    assert!(handle.inject(signal("p1", json!({ "candidate": early }))).await);
    settle(&mut controller, &handle, 1).await;
    assert!(!peer.calls().iter().any(|c| matches!(c, PeerCall::AddCandidate(_))));

    assert!(
        handle
            .inject(signal("p1", json!({"type": "answer", "sdp": "remote-answer"})))
            .await
    );
    drive_until(&mut controller, |_| {
        peer.calls().contains(&PeerCall::AddCandidate(early.candidate.clone()))
    })
    .await;

    let calls = peer.calls();
    let answer_at = calls
        .iter()
        .position(|c| *c == PeerCall::SetRemote(SdpType::Answer))
        .unwrap();
    let candidate_at = calls
        .iter()
        .position(|c| matches!(c, PeerCall::AddCandidate(_)))
        .unwrap();
    assert!(answer_at < candidate_at);
}

#[tokio::test]
async fn remote_tracks_build_the_remote_stream() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;
    assert!(controller.remote_stream().is_none());

    let peer = backend.last_peer().unwrap();
    assert!(peer.emit_track(StubTrack::new(MediaKind::Audio)));
    assert!(peer.emit_track(StubTrack::new(MediaKind::Video)));
    drive_until(&mut controller, |c| {
        c.remote_stream().is_some_and(|s| s.len() == 2)
    })
    .await;
}

// =============================================================================
// Responder
// =============================================================================

#[tokio::test]
async fn responder_answers_the_offer() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("z9", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingOffer).await;
    assert!(sent_payloads(&mut handle).is_empty());

    let early = candidate("candidate:1 1 udp 1 10.0.0.3 5000 typ host");
    assert!(handle.inject(signal("p1", json!({ "candidate": early }))).await);
    assert!(
        handle
            .inject(signal("p1", json!({"type": "offer", "sdp": "remote-offer"})))
            .await
    );
    let peer = backend.last_peer().unwrap();
    drive_until(&mut controller, |c| {
        c.negotiation_phase() == Some(Phase::Stable)
            && peer.calls().contains(&PeerCall::AddCandidate(early.candidate.clone()))
    })
    .await;

    assert_eq!(
        sent_payloads(&mut handle),
        vec![(
            "p1".to_string(),
            NegotiationPayload::Description(SessionDescription::answer("stub-answer-0"))
        )]
    );
    assert_eq!(peer.offers_created(), 0);
    let calls = peer.calls();
    let offer_at = calls
        .iter()
        .position(|c| *c == PeerCall::SetRemote(SdpType::Offer))
        .unwrap();
    let candidate_at = calls
        .iter()
        .position(|c| matches!(c, PeerCall::AddCandidate(_)))
        .unwrap();
    assert!(offer_at < candidate_at);
}

#[tokio::test]
async fn rejected_candidate_is_skipped() {
    let backend = StubBackend::new().with_failing("add ice candidate");
    let (mut controller, mut handle) = setup("z9", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingOffer).await;

    assert!(
        handle
            .inject(signal("p1", json!({"type": "offer", "sdp": "remote-offer"})))
            .await
    );
    drive_until(&mut controller, |c| {
        c.negotiation_phase() == Some(Phase::Stable)
    })
    .await;

    let bad = candidate("candidate:1 1 udp 1 10.0.0.4 5000 typ host");
    assert!(handle.inject(signal("p1", json!({ "candidate": bad }))).await);
    let peer = backend.last_peer().unwrap();
    drive_until(&mut controller, |_| {
        peer.calls().contains(&PeerCall::AddCandidate(bad.candidate.clone()))
    })
    .await;
    settle(&mut controller, &handle, 1).await;

    assert_eq!(controller.negotiation_phase(), Some(Phase::Stable));
    assert!(!peer.is_closed());
}

// =============================================================================
// Failures and teardown
// =============================================================================

#[tokio::test]
async fn media_failure_keeps_the_chat() {
    let backend = StubBackend::new().with_media_error(MediaAccessError::PermissionDenied);
    let (mut controller, mut handle) = setup("a1", &backend);

    controller
        .request_match(SessionMode::Video, "")
        .await
        .unwrap();
    assert!(handle.inject(SignalingEvent::Matched("p1".into())).await);
    drive_until(&mut controller, |c| {
        c.chat_log().last() == Some(&Message::system(MEDIA_ERROR_NOTICE))
    })
    .await;

    assert_eq!(controller.state(), SessionState::Connected);
    assert!(controller.negotiation_phase().is_none());
    assert!(backend.peers().is_empty());
    handle.sent();

    controller.send_message("no camera, sorry").await.unwrap();
    assert_eq!(
        handle.sent().first(),
        Some(&SignalingRequest::SendMessage {
            to: "p1".into(),
            text: "no camera, sorry".into()
        })
    );
}

#[tokio::test]
async fn malformed_payload_only_ends_the_negotiation() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;

    assert!(handle.inject(signal("p1", json!({"bogus": true}))).await);
    drive_until(&mut controller, |c| c.negotiation_phase().is_none()).await;

    assert_eq!(controller.state(), SessionState::Connected);
    assert!(backend.last_peer().unwrap().is_closed());
    assert!(backend.acquired_tracks().iter().all(StubTrack::is_stopped));
    handle.sent();
    controller.send_message("still here").await.unwrap();
    assert!(!handle.sent().is_empty());
}

#[tokio::test]
async fn payload_from_someone_else_is_ignored() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;

    assert!(
        handle
            .inject(signal("mallory", json!({"type": "answer", "sdp": "forged"})))
            .await
    );
    settle(&mut controller, &handle, 3).await;

    assert_eq!(controller.negotiation_phase(), Some(Phase::AwaitingAnswer));
    assert!(
        !backend
            .last_peer()
            .unwrap()
            .calls()
            .contains(&PeerCall::SetRemote(SdpType::Answer))
    );
}

#[tokio::test]
async fn partner_leaving_mid_negotiation_releases_everything() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;
    let peer = backend.last_peer().unwrap();
    assert!(peer.emit_track(StubTrack::new(MediaKind::Video)));

    assert!(handle.inject(SignalingEvent::PartnerDisconnected).await);
    drive_until(&mut controller, |c| c.state() == SessionState::Idle).await;

    assert!(controller.negotiation_phase().is_none());
    assert!(controller.local_media().is_none());
    assert!(controller.remote_stream().is_none());
    assert!(peer.is_closed());
    assert!(!peer.has_handlers());
    assert!(backend.acquired_tracks().iter().all(StubTrack::is_stopped));
}

#[tokio::test]
async fn late_media_after_disconnect_is_released() {
    let (backend, gate) = StubBackend::new().with_media_gate();
    let (mut controller, mut handle) = setup("a1", &backend);

    controller
        .request_match(SessionMode::Video, "")
        .await
        .unwrap();
    assert!(handle.inject(SignalingEvent::Matched("p1".into())).await);
    drive_until(&mut controller, |c| {
        c.negotiation_phase() == Some(Phase::Opening)
    })
    .await;
    assert!(handle.inject(SignalingEvent::PartnerDisconnected).await);
    drive_until(&mut controller, |c| c.state() == SessionState::Idle).await;

    // Capture completes after the session it belonged to is gone.
    gate.release();
    tokio::time::timeout(Duration::from_secs(5), controller.process_next())
        .await
        .expect("late completion never arrived")
        .unwrap();

    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.negotiation_phase().is_none());
    assert!(backend.peers().is_empty());
    let tracks = backend.acquired_tracks();
    assert_eq!(tracks.len(), 2);
    assert!(tracks.iter().all(StubTrack::is_stopped));
    assert!(sent_payloads(&mut handle).is_empty());
}

#[tokio::test]
async fn next_replaces_the_connection() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;
    let first = backend.last_peer().unwrap();
    handle.sent();

    controller.next().await.unwrap();
    assert_eq!(controller.state(), SessionState::Waiting);
    assert!(controller.negotiation_phase().is_none());
    assert!(first.is_closed());

    assert!(handle.inject(SignalingEvent::Matched("p2".into())).await);
    drive_until(&mut controller, |c| {
        c.negotiation_phase() == Some(Phase::AwaitingAnswer)
    })
    .await;

    assert_eq!(backend.peers().len(), 2);
    assert_eq!(
        sent_payloads(&mut handle),
        vec![(
            "p2".to_string(),
            NegotiationPayload::Description(SessionDescription::offer("stub-offer-1"))
        )]
    );
}

#[tokio::test]
async fn ending_twice_closes_once() {
    let backend = StubBackend::new();
    let (mut controller, mut handle) = setup("a1", &backend);
    match_video(&mut controller, &mut handle, "p1", Phase::AwaitingAnswer).await;
    handle.sent();

    controller.end().await.unwrap();
    controller.end().await.unwrap();

    let peer = backend.last_peer().unwrap();
    assert_eq!(
        peer.calls()
            .iter()
            .filter(|c| **c == PeerCall::Close)
            .count(),
        1
    );
    assert!(!peer.emit_candidate(candidate("candidate:1 1 udp 1 10.0.0.5 5000 typ host")));
    assert_eq!(handle.sent(), vec![SignalingRequest::LeaveChat]);
}
