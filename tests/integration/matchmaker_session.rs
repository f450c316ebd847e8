//! Integration tests for client sessions against a real in-process
//! matchmaker over WebSocket: keyword matching, chat relay, typing,
//! departures and video negotiation end to end.
//!
//! Verification command: `cargo test --test matchmaker_session`

use std::sync::Arc;
use std::time::Duration;

use strangers::chat::Message;
use strangers::negotiation::Phase;
use strangers::negotiation::stub::StubBackend;
use strangers::session::{
    CONNECTED_NOTICE, CONNECTION_LOST_NOTICE, DISCONNECTED_NOTICE, SessionController, SessionMode,
    SessionState,
};
use strangers::signaling::ws::{WsOptions, WsSignalingChannel};
use strangers_matchmaker::lobby::Lobby;
use strangers_matchmaker::server::{start_server, start_server_with_state};

type Client = SessionController<WsSignalingChannel, StubBackend>;

// =============================================================================
// Test helpers
// =============================================================================

async fn client(addr: std::net::SocketAddr) -> Client {
    let url = format!("ws://{addr}/ws");
    let channel = WsSignalingChannel::connect(&url, &WsOptions::default())
        .await
        .unwrap();
    SessionController::new(channel, StubBackend::new(), Vec::new())
}

/// Apply inbound items on one client until `done` holds.
async fn drive_until<F>(client: &mut Client, mut done: F)
where
    F: FnMut(&Client) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(client) {
        tokio::time::timeout_at(deadline, client.process_next())
            .await
            .expect("client made no progress")
            .unwrap();
    }
}

/// Apply inbound items on both clients until `done` holds for the pair.
async fn drive_both_until<F>(a: &mut Client, b: &mut Client, mut done: F)
where
    F: FnMut(&Client, &Client) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(a, b) {
        let step = async {
            tokio::select! {
                input = a.next_input() => a.handle_input(input).await,
                input = b.next_input() => b.handle_input(input).await,
            }
        };
        tokio::time::timeout_at(deadline, step)
            .await
            .expect("clients made no progress")
            .unwrap();
    }
}

async fn pair(a: &mut Client, b: &mut Client, mode: SessionMode, keyword: &str) {
    a.request_match(mode, keyword).await.unwrap();
    b.request_match(mode, keyword).await.unwrap();
    drive_both_until(a, b, |a, b| {
        a.state() == SessionState::Connected && b.state() == SessionState::Connected
    })
    .await;
}

// =============================================================================
// Matching
// =============================================================================

#[tokio::test]
async fn clients_with_the_same_keyword_are_paired() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;

    pair(&mut a, &mut b, SessionMode::Text, "Music").await;

    assert_eq!(a.partner(), b.local_identity().as_ref());
    assert_eq!(b.partner(), a.local_identity().as_ref());
    assert_eq!(a.keyword(), Some("Music"));
    assert_eq!(
        a.chat_log().entries(),
        &[Message::system(CONNECTED_NOTICE)]
    );
}

#[tokio::test]
async fn different_keywords_are_not_paired() {
    let lobby = Arc::new(Lobby::new());
    let (addr, _server) = start_server_with_state("127.0.0.1:0", Arc::clone(&lobby))
        .await
        .unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;
    let mut c = client(addr).await;

    a.request_match(SessionMode::Text, "music").await.unwrap();
    b.request_match(SessionMode::Text, "films").await.unwrap();
    c.request_match(SessionMode::Text, "music").await.unwrap();
    drive_both_until(&mut a, &mut c, |a, c| {
        a.state() == SessionState::Connected && c.state() == SessionState::Connected
    })
    .await;
    assert_eq!(a.partner(), c.local_identity().as_ref());

    let b_id = b.local_identity().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !lobby.is_waiting(b_id.as_str()).await {
        assert!(tokio::time::Instant::now() < deadline, "b never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.state(), SessionState::Waiting);
}

#[tokio::test]
async fn keywords_are_matched_case_sensitively() {
    let lobby = Arc::new(Lobby::new());
    let (addr, _server) = start_server_with_state("127.0.0.1:0", Arc::clone(&lobby))
        .await
        .unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;

    a.request_match(SessionMode::Text, "Music").await.unwrap();
    b.request_match(SessionMode::Text, "music").await.unwrap();

    let a_id = a.local_identity().unwrap();
    let b_id = b.local_identity().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(lobby.is_waiting(a_id.as_str()).await && lobby.is_waiting(b_id.as_str()).await) {
        assert!(tokio::time::Instant::now() < deadline, "clients never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.state(), SessionState::Waiting);
    assert_eq!(b.state(), SessionState::Waiting);
    assert_eq!(a.keyword(), Some("Music"));
    assert_eq!(b.keyword(), Some("music"));
}

#[tokio::test]
async fn online_count_is_reported() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let mut a = client(addr).await;
    let _b = client(addr).await;

    drive_until(&mut a, |a| a.online_count() == Some(2)).await;
}

// =============================================================================
// Chatting
// =============================================================================

#[tokio::test]
async fn messages_and_typing_reach_the_partner() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;
    pair(&mut a, &mut b, SessionMode::Text, "").await;

    a.send_message("hi").await.unwrap();
    drive_until(&mut b, |b| {
        b.chat_log().last() == Some(&Message::stranger("hi"))
    })
    .await;
    assert_eq!(a.chat_log().last(), Some(&Message::you("hi")));

    b.notify_typing().await.unwrap();
    drive_until(&mut a, Client::is_stranger_typing).await;

    b.send_message("hello").await.unwrap();
    drive_until(&mut a, |a| {
        a.chat_log().last() == Some(&Message::stranger("hello")) && !a.is_stranger_typing()
    })
    .await;
}

// =============================================================================
// Leaving
// =============================================================================

#[tokio::test]
async fn ending_notifies_the_partner() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;
    pair(&mut a, &mut b, SessionMode::Text, "").await;

    a.end().await.unwrap();
    assert_eq!(a.state(), SessionState::Idle);
    assert!(a.chat_log().is_empty());

    drive_until(&mut b, |b| b.state() == SessionState::Idle).await;
    assert_eq!(
        b.chat_log().last(),
        Some(&Message::system(DISCONNECTED_NOTICE))
    );

    // Both can look again and find each other.
    b.next().await.unwrap();
    a.request_match(SessionMode::Text, "").await.unwrap();
    drive_both_until(&mut a, &mut b, |a, b| {
        a.state() == SessionState::Connected && b.state() == SessionState::Connected
    })
    .await;
}

#[tokio::test]
async fn dropping_a_client_notifies_the_partner() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;
    pair(&mut a, &mut b, SessionMode::Text, "").await;

    drop(a);
    drive_until(&mut b, |b| b.state() == SessionState::Idle).await;
    assert_eq!(
        b.chat_log().last(),
        Some(&Message::system(DISCONNECTED_NOTICE))
    );
}

#[tokio::test]
async fn server_shutdown_is_reported() {
    let lobby = Arc::new(Lobby::new());
    let (addr, _server) = start_server_with_state("127.0.0.1:0", Arc::clone(&lobby))
        .await
        .unwrap();
    let mut a = client(addr).await;
    a.request_match(SessionMode::Text, "").await.unwrap();

    lobby.close_all_connections().await;
    drive_until(&mut a, |a| !a.is_channel_open()).await;

    assert_eq!(a.state(), SessionState::Idle);
    assert_eq!(
        a.chat_log().last(),
        Some(&Message::system(CONNECTION_LOST_NOTICE))
    );
    assert!(a.request_match(SessionMode::Text, "").await.is_err());
}

// =============================================================================
// Video
// =============================================================================

#[tokio::test]
async fn video_peers_negotiate_through_the_matchmaker() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let mut a = client(addr).await;
    let mut b = client(addr).await;
    pair(&mut a, &mut b, SessionMode::Video, "cats").await;

    drive_both_until(&mut a, &mut b, |a, b| {
        a.negotiation_phase() == Some(Phase::Stable)
            && b.negotiation_phase() == Some(Phase::Stable)
    })
    .await;

    assert!(a.local_media().is_some());
    assert!(b.local_media().is_some());
}
