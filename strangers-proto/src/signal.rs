//! Signaling frames exchanged between clients and the matchmaker.
//!
//! Requests flow client → server, events flow server → client. Both are
//! adjacently tagged (`{"event": ..., "data": ...}`) with `snake_case`
//! event names so they interoperate with socket.io-style peers.

use serde::{Deserialize, Serialize};

/// The keyword used when a match request carries no (or only blank) keyword.
pub const WILDCARD_KEYWORD: &str = "random";

/// Normalizes a user-entered keyword: trims surrounding whitespace and falls
/// back to [`WILDCARD_KEYWORD`] when nothing is left.
#[must_use]
pub fn normalize_keyword(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        WILDCARD_KEYWORD.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Frames sent from a client to the matchmaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalingRequest {
    /// Ask to be paired with a stranger sharing `keyword`.
    FindStranger {
        /// Normalized match keyword.
        keyword: String,
    },

    /// A chat line for the current partner.
    SendMessage {
        /// Partner identity.
        to: String,
        /// Message text, sent as typed.
        text: String,
    },

    /// The local user started typing.
    Typing {
        /// Partner identity.
        to: String,
    },

    /// The local user stopped typing (or sent the message).
    StopTyping {
        /// Partner identity.
        to: String,
    },

    /// An opaque negotiation payload for the partner (description or candidate).
    WebrtcSignal {
        /// Partner identity.
        to: String,
        /// Payload, see [`crate::negotiation::NegotiationPayload`].
        data: serde_json::Value,
    },

    /// Leave the waiting queue or the current pairing.
    LeaveChat,
}

/// Frames sent from the matchmaker to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalingEvent {
    /// First frame on every connection: the identity issued to this client.
    Welcome {
        /// Opaque identity, unique per live connection.
        id: String,
    },

    /// Number of clients currently connected.
    OnlineCount(u64),

    /// Paired with the given partner identity.
    Matched(String),

    /// A chat line relayed from the partner (or echoed back).
    ReceiveMessage {
        /// Identity of the original sender.
        from: String,
        /// Message text.
        text: String,
    },

    /// The partner left or lost its connection.
    PartnerDisconnected,

    /// The partner started typing.
    StrangerTyping,

    /// The partner stopped typing.
    StrangerStopTyping,

    /// A negotiation payload relayed from the partner.
    WebrtcSignal {
        /// Identity of the sender, enforced by the server.
        from: String,
        /// Payload, see [`crate::negotiation::NegotiationPayload`].
        data: serde_json::Value,
    },

    /// The server rejected a request.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}
