//! WebSocket signaling channel to a `Strangers` matchmaker.
//!
//! Implements [`SignalingChannel`] over a WebSocket connection. Frames are
//! JSON text frames (see [`strangers_proto::codec`]). The connection is
//! never re-established: when it drops, the subscription receiver ends and
//! every later `send` fails with [`ChannelError::Closed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use strangers_proto::codec;
use strangers_proto::signal::{SignalingEvent, SignalingRequest};

use super::{ChannelError, Identity, SignalingChannel, Subscription, deliver};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Connection tuning for [`WsSignalingChannel::connect`].
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Timeout for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Timeout for the server's `welcome` frame.
    pub handshake_timeout: Duration,
    /// Capacity of the inbound event channel.
    pub channel_capacity: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

/// WebSocket signaling channel implementing [`SignalingChannel`].
///
/// Created via [`WsSignalingChannel::connect`], which establishes the
/// connection, waits for the `welcome` frame carrying this client's
/// identity, and spawns a background reader task.
pub struct WsSignalingChannel {
    /// Identity issued by the server in the `welcome` frame.
    identity: Identity,
    /// The matchmaker URL (ws:// or wss://).
    server_url: String,
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Current subscriber of inbound events.
    subscription: Subscription,
    /// Whether the WebSocket connection is still up.
    connected: Arc<AtomicBool>,
    /// Handle to the background reader task.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsSignalingChannel {
    /// Connect to a matchmaker and complete the welcome handshake.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Timeout`] if connecting or the handshake times out.
    /// - [`ChannelError::Unreachable`] if the server refuses the connection.
    /// - [`ChannelError::Handshake`] if the first frame is not a `welcome`.
    /// - [`ChannelError::Io`] for TLS and other transport failures.
    pub async fn connect(server_url: &str, options: &WsOptions) -> Result<Self, ChannelError> {
        let (ws_stream, _response) =
            tokio::time::timeout(options.connect_timeout, connect_async(server_url))
                .await
                .map_err(|_| {
                    tracing::warn!(url = server_url, "matchmaker connect timed out");
                    ChannelError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = server_url, err = %e, "matchmaker connect failed");
                    map_ws_connect_error(server_url, e)
                })?;

        let (ws_sender, mut ws_reader) = ws_stream.split();

        let identity = tokio::time::timeout(
            options.handshake_timeout,
            wait_for_welcome(&mut ws_reader),
        )
        .await
        .map_err(|_| {
            tracing::warn!(url = server_url, "matchmaker welcome timed out");
            ChannelError::Timeout
        })??;

        tracing::info!(identity = %identity, url = server_url, "connected to matchmaker");

        let subscription = Subscription::new(options.channel_capacity);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            subscription.slot(),
            Arc::clone(&connected),
        ));

        Ok(Self {
            identity,
            server_url: server_url.to_string(),
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            subscription,
            connected,
            reader_handle,
        })
    }

    /// Return the matchmaker URL this channel is connected to.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether the WebSocket connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl SignalingChannel for WsSignalingChannel {
    fn local_identity(&self) -> Option<Identity> {
        Some(self.identity.clone())
    }

    fn subscribe(&self) -> mpsc::Receiver<SignalingEvent> {
        self.subscription.subscribe(self.is_connected())
    }

    fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    /// Encode the request as a JSON text frame and write it to the socket.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] if the connection is down or the write fails.
    /// - [`ChannelError::Codec`] if the request cannot be encoded.
    async fn send(&self, request: SignalingRequest) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }

        let text = codec::encode(&request)?;

        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "matchmaker send failed");
            self.connected.store(false, Ordering::Relaxed);
            ChannelError::Closed
        })
    }
}

/// Read frames until the server's `welcome` arrives.
///
/// Ping/pong frames are skipped; anything else before the welcome is a
/// protocol violation.
async fn wait_for_welcome(ws_reader: &mut WsReader) -> Result<Identity, ChannelError> {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                return match codec::decode::<SignalingEvent>(&text) {
                    Ok(SignalingEvent::Welcome { id }) if !id.is_empty() => Ok(Identity::new(id)),
                    Ok(SignalingEvent::Error { reason }) => {
                        tracing::warn!(reason = %reason, "matchmaker rejected connection");
                        Err(ChannelError::Handshake(reason))
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "unexpected frame before welcome");
                        Err(ChannelError::Handshake(
                            "unexpected frame before welcome".to_string(),
                        ))
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "malformed welcome frame");
                        Err(ChannelError::Handshake(format!("malformed welcome: {e}")))
                    }
                };
            }
            Ok(Message::Close(_)) => {
                tracing::warn!("matchmaker closed connection during handshake");
                return Err(ChannelError::Closed);
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Binary(_)) => {
                return Err(ChannelError::Handshake(
                    "unexpected binary frame during handshake".to_string(),
                ));
            }
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(ChannelError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    tracing::warn!("matchmaker stream ended during handshake");
    Err(ChannelError::Closed)
}

/// Background task that decodes inbound frames and hands them to the
/// current subscriber.
///
/// Malformed frames are logged and skipped; the task does not disconnect on
/// bad data. On close or read error it marks the channel disconnected and
/// drops the subscriber so the receiver observes the end of the stream.
async fn reader_loop(
    mut ws_reader: WsReader,
    slot: Arc<parking_lot::Mutex<Option<mpsc::Sender<SignalingEvent>>>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode::<SignalingEvent>(&text) {
                Ok(event) => {
                    if !deliver(&slot, event).await {
                        tracing::debug!("no subscriber, dropping signaling event");
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed signaling frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("matchmaker closed the connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Binary(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "matchmaker read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    slot.lock().take();
    tracing::info!("signaling reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ChannelError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> ChannelError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                ChannelError::Unreachable(url.to_string())
            } else {
                ChannelError::Io(io_err)
            }
        }
        WsError::Tls(_) => ChannelError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => ChannelError::Io(std::io::Error::other(format!(
            "matchmaker HTTP error: status {}",
            response.status()
        ))),
        other => ChannelError::Io(std::io::Error::other(format!(
            "matchmaker connection error: {other}"
        ))),
    }
}
