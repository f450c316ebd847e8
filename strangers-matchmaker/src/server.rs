//! WebSocket endpoint of the matchmaker.
//!
//! Each connection is assigned a fresh UUIDv7 identity, greeted with
//! `welcome`, and then served by a writer task (draining its lobby channel)
//! and a reader task (decoding request frames and applying them to the
//! [`Lobby`]).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use strangers_proto::codec::{self, CodecError};
use strangers_proto::signal::{SignalingRequest, normalize_keyword};
use tokio::sync::mpsc;

use crate::lobby::Lobby;

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Register with the lobby (sends `welcome` and the online count).
/// 2. Serve request frames until either side closes.
/// 3. Unregister, which notifies any partner.
pub async fn handle_socket(socket: WebSocket, lobby: Arc<Lobby>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let id = uuid::Uuid::now_v7().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    lobby.register(&id, tx).await;

    let writer_id = id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(id = %writer_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_id = id.clone();
    let reader_lobby = Arc::clone(&lobby);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_message(&reader_id, text.as_str(), &reader_lobby).await;
                }
                Message::Binary(_) => {
                    reader_lobby
                        .send_error(&reader_id, "binary frames are not supported")
                        .await;
                }
                Message::Close(_) => {
                    tracing::info!(id = %reader_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore ping/pong frames.
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    lobby.unregister(&id).await;
}

/// Decodes and applies one request frame.
async fn handle_text_message(id: &str, text: &str, lobby: &Arc<Lobby>) {
    let request: SignalingRequest = match codec::decode_bounded(text, lobby.max_frame_size()) {
        Ok(request) => request,
        Err(e @ CodecError::FrameTooLarge { .. }) => {
            tracing::warn!(id = %id, error = %e, "frame exceeds size limit");
            lobby.send_error(id, e.to_string()).await;
            return;
        }
        Err(e) => {
            tracing::warn!(id = %id, error = %e, "failed to decode frame");
            lobby.send_error(id, format!("malformed frame: {e}")).await;
            return;
        }
    };

    match request {
        SignalingRequest::FindStranger { keyword } => {
            let outcome = lobby.find_stranger(id, &normalize_keyword(&keyword)).await;
            tracing::debug!(id = %id, ?outcome, "find_stranger handled");
        }
        SignalingRequest::LeaveChat => lobby.leave(id).await,
        relayed => lobby.relay(id, relayed).await,
    }
}

/// Starts the matchmaker on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(Lobby::new())).await
}

/// Starts the matchmaker with a caller-provided lobby.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    lobby: Arc<Lobby>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(lobby);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "matchmaker server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(lobby): axum::extract::State<Arc<Lobby>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, lobby))
}
