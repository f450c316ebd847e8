//! Integration tests for the session lifecycle: matching, chatting, typing,
//! ending and skipping, with the matchmaker played by a loopback channel.
//!
//! Verification command: `cargo test --test session_lifecycle`

use std::time::Duration;

use strangers::chat::{Message, Sender};
use strangers::negotiation::stub::StubBackend;
use strangers::session::{
    CONNECTED_NOTICE, CONNECTION_LOST_NOTICE, DISCONNECTED_NOTICE, SessionController,
    SessionError, SessionMode, SessionState,
};
use strangers::signaling::Identity;
use strangers::signaling::loopback::{LoopbackChannel, LoopbackHandle};
use strangers_proto::signal::{SignalingEvent, SignalingRequest};

type Controller = SessionController<LoopbackChannel, StubBackend>;

// =============================================================================
// Test helpers
// =============================================================================

fn setup() -> (Controller, LoopbackHandle, StubBackend) {
    let backend = StubBackend::new();
    let (channel, handle) = LoopbackChannel::new(Identity::new("a1"));
    let controller = SessionController::new(channel, backend.clone(), Vec::new());
    (controller, handle, backend)
}

/// Injects one event and lets the controller apply it.
async fn deliver(controller: &mut Controller, handle: &LoopbackHandle, event: SignalingEvent) {
    assert!(handle.inject(event).await, "controller is not subscribed");
    tokio::time::timeout(Duration::from_secs(5), controller.process_next())
        .await
        .expect("timed out waiting for the event")
        .unwrap();
}

/// Requests a text match and pairs with `partner`, discarding the sent frames.
async fn connect_text(controller: &mut Controller, handle: &mut LoopbackHandle, partner: &str) {
    controller
        .request_match(SessionMode::Text, "music")
        .await
        .unwrap();
    deliver(controller, handle, SignalingEvent::Matched(partner.into())).await;
    assert_eq!(controller.state(), SessionState::Connected);
    handle.sent();
}

// =============================================================================
// Matching
// =============================================================================

#[tokio::test]
async fn match_appends_connected_notice() {
    let (mut controller, mut handle, backend) = setup();
    controller
        .request_match(SessionMode::Text, "")
        .await
        .unwrap();
    assert_eq!(
        handle.sent(),
        vec![SignalingRequest::FindStranger {
            keyword: "random".into()
        }]
    );

    deliver(&mut controller, &handle, SignalingEvent::Matched("p1".into())).await;

    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(controller.partner(), Some(&Identity::new("p1")));
    assert_eq!(
        controller.chat_log().entries(),
        &[Message::system(CONNECTED_NOTICE)]
    );
    // Text sessions never touch the RTC backend.
    assert!(backend.peers().is_empty());
    assert!(backend.acquired_tracks().is_empty());
    assert!(controller.negotiation_phase().is_none());
}

#[tokio::test]
async fn request_match_while_connected_changes_nothing() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;

    let err = controller
        .request_match(SessionMode::Video, "films")
        .await
        .unwrap_err();
    match err {
        SessionError::InvalidState { state, .. } => assert_eq!(state, SessionState::Connected),
        other => panic!("expected InvalidState, got {other:?}"),
    }
    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(controller.mode(), Some(SessionMode::Text));
    assert_eq!(controller.keyword(), Some("music"));
    assert_eq!(controller.chat_log().len(), 1);
    assert!(handle.sent().is_empty());
}

#[tokio::test]
async fn welcome_and_server_errors_leave_state_alone() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;

    deliver(
        &mut controller,
        &handle,
        SignalingEvent::Welcome { id: "a1".into() },
    )
    .await;
    deliver(
        &mut controller,
        &handle,
        SignalingEvent::Error {
            reason: "not paired with x".into(),
        },
    )
    .await;

    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(controller.chat_log().len(), 1);
}

// =============================================================================
// Chat and typing
// =============================================================================

#[tokio::test]
async fn send_message_appends_and_stops_typing() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    deliver(&mut controller, &handle, SignalingEvent::StrangerTyping).await;
    assert!(controller.is_stranger_typing());

    controller.send_message("hi").await.unwrap();

    assert_eq!(controller.chat_log().last(), Some(&Message::you("hi")));
    assert!(!controller.is_stranger_typing());
    assert_eq!(
        handle.sent(),
        vec![
            SignalingRequest::SendMessage {
                to: "p1".into(),
                text: "hi".into()
            },
            SignalingRequest::StopTyping { to: "p1".into() },
        ]
    );
}

#[tokio::test]
async fn blank_messages_are_ignored() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    let before = controller.chat_log().len();

    controller.send_message("").await.unwrap();
    controller.send_message("   ").await.unwrap();

    assert_eq!(controller.chat_log().len(), before);
    assert!(handle.sent().is_empty());
}

#[tokio::test]
async fn messages_outside_a_session_are_ignored() {
    let (mut controller, mut handle, _backend) = setup();
    controller.send_message("hi").await.unwrap();
    assert!(controller.chat_log().is_empty());
    assert!(handle.sent().is_empty());

    controller
        .request_match(SessionMode::Text, "")
        .await
        .unwrap();
    handle.sent();
    controller.send_message("anyone?").await.unwrap();
    controller.notify_typing().await.unwrap();
    assert!(controller.chat_log().is_empty());
    assert!(handle.sent().is_empty());
}

#[tokio::test]
async fn received_messages_are_attributed_to_the_stranger() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;

    deliver(
        &mut controller,
        &handle,
        SignalingEvent::ReceiveMessage {
            from: "p1".into(),
            text: "hello".into(),
        },
    )
    .await;

    let last = controller.chat_log().last().unwrap();
    assert_eq!(last.sender, Sender::Stranger);
    assert_eq!(last.text, "hello");
}

#[tokio::test]
async fn typing_indicator_follows_partner() {
    let (mut controller, mut handle, _backend) = setup();

    // Typing events outside a session do nothing.
    deliver(&mut controller, &handle, SignalingEvent::StrangerTyping).await;
    assert!(!controller.is_stranger_typing());

    connect_text(&mut controller, &mut handle, "p1").await;
    deliver(&mut controller, &handle, SignalingEvent::StrangerTyping).await;
    assert!(controller.is_stranger_typing());
    deliver(&mut controller, &handle, SignalingEvent::StrangerStopTyping).await;
    assert!(!controller.is_stranger_typing());
}

#[tokio::test]
async fn local_typing_is_forwarded_to_partner() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;

    controller.notify_typing().await.unwrap();
    controller.notify_stop_typing().await.unwrap();

    assert_eq!(
        handle.sent(),
        vec![
            SignalingRequest::Typing { to: "p1".into() },
            SignalingRequest::StopTyping { to: "p1".into() },
        ]
    );
}

// =============================================================================
// Leaving
// =============================================================================

#[tokio::test]
async fn end_clears_log_and_releases_the_pairing() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    deliver(&mut controller, &handle, SignalingEvent::StrangerTyping).await;

    controller.end().await.unwrap();

    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.chat_log().is_empty());
    assert!(!controller.is_stranger_typing());
    assert!(controller.partner().is_none());
    assert_eq!(handle.sent(), vec![SignalingRequest::LeaveChat]);
}

#[tokio::test]
async fn end_with_unreachable_server_still_leaves_an_empty_log() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    controller.send_message("hello").await.unwrap();
    handle.sent();
    handle.set_fail_sends(true);

    let err = controller.end().await.unwrap_err();

    assert!(matches!(err, SessionError::Channel(_)));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.chat_log().is_empty());
    assert!(controller.partner().is_none());
}

#[tokio::test]
async fn end_while_idle_sends_nothing() {
    let (mut controller, mut handle, _backend) = setup();
    controller.end().await.unwrap();
    controller.end().await.unwrap();
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.chat_log().is_empty());
    assert!(handle.sent().is_empty());
}

#[tokio::test]
async fn next_clears_log_and_searches_again() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    deliver(
        &mut controller,
        &handle,
        SignalingEvent::ReceiveMessage {
            from: "p1".into(),
            text: "bye".into(),
        },
    )
    .await;

    controller.next().await.unwrap();

    assert_eq!(controller.state(), SessionState::Waiting);
    assert!(controller.chat_log().is_empty());
    assert!(controller.partner().is_none());
    assert_eq!(controller.keyword(), Some("music"));
    assert_eq!(
        handle.sent(),
        vec![SignalingRequest::FindStranger {
            keyword: "music".into()
        }]
    );
}

#[tokio::test]
async fn partner_disconnect_returns_to_idle() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    deliver(&mut controller, &handle, SignalingEvent::StrangerTyping).await;

    deliver(&mut controller, &handle, SignalingEvent::PartnerDisconnected).await;

    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!controller.is_stranger_typing());
    assert!(controller.partner().is_none());
    assert_eq!(
        controller.chat_log().last(),
        Some(&Message::system(DISCONNECTED_NOTICE))
    );

    // The previous request is remembered, so the user can look again.
    controller.next().await.unwrap();
    assert_eq!(controller.state(), SessionState::Waiting);
    assert!(controller.chat_log().is_empty());
    assert_eq!(
        handle.sent(),
        vec![SignalingRequest::FindStranger {
            keyword: "music".into()
        }]
    );
}

#[tokio::test]
async fn stale_disconnect_while_waiting_is_ignored() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    controller.next().await.unwrap();

    deliver(&mut controller, &handle, SignalingEvent::PartnerDisconnected).await;

    assert_eq!(controller.state(), SessionState::Waiting);
    assert!(controller.chat_log().is_empty());
}

// =============================================================================
// Channel failures
// =============================================================================

#[tokio::test]
async fn lost_connection_is_reported() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;

    handle.close();
    tokio::time::timeout(Duration::from_secs(5), controller.process_next())
        .await
        .expect("timed out waiting for the close")
        .unwrap();

    assert!(!controller.is_channel_open());
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(
        controller.chat_log().last(),
        Some(&Message::system(CONNECTION_LOST_NOTICE))
    );
}

#[tokio::test]
async fn failed_send_resets_the_session() {
    let (mut controller, mut handle, _backend) = setup();
    connect_text(&mut controller, &mut handle, "p1").await;
    handle.set_fail_sends(true);

    let err = controller.send_message("hello?").await.unwrap_err();

    assert!(matches!(err, SessionError::Channel(_)));
    assert_eq!(controller.state(), SessionState::Idle);
    let last = controller.chat_log().last().unwrap();
    assert_eq!(last.sender, Sender::System);
    assert!(last.text.starts_with("Could not reach the server:"));
}
