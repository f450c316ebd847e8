//! Peer negotiation payloads carried inside `webrtc_signal` frames.
//!
//! The JSON shapes match what browsers produce: a session description is
//! `{"type": "offer" | "answer", "sdp": ...}` and a candidate is wrapped as
//! `{"candidate": {"candidate", "sdpMid", "sdpMLineIndex", "usernameFragment"}}`.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the initiating side.
    Offer,
    /// Final answer from the responding side.
    Answer,
    /// Provisional answer.
    Pranswer,
    /// Roll back to the last stable state.
    Rollback,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// An SDP session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer, answer, ...
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// Raw SDP text.
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Payload of a `webrtc_signal` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NegotiationPayload {
    /// An offer or answer.
    Description(SessionDescription),
    /// A trickled candidate.
    Candidate {
        /// The candidate itself.
        candidate: IceCandidate,
    },
}

impl NegotiationPayload {
    /// Parse a payload out of the opaque `data` field of a `webrtc_signal`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the value is neither a
    /// description nor a wrapped candidate.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CodecError> {
        serde_json::from_value(value).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Convert into the opaque `data` value of a `webrtc_signal`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the payload cannot be serialized.
    pub fn to_value(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }
}
