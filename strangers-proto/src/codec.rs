//! Serialization and deserialization for the `Strangers` wire protocol.
//!
//! Every signaling frame is a JSON text frame of the form
//! `{"event": <name>, "data": <payload>}`. The codec is generic over the
//! frame type so clients and the matchmaker share one implementation.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size of the offending frame in bytes.
        size: usize,
        /// Maximum accepted frame size in bytes.
        max: usize,
    },
}

/// Encodes a frame as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame from a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not valid JSON or does
/// not describe a known frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame, rejecting it before parsing if it exceeds `max` bytes.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for oversized input, otherwise the
/// same errors as [`decode`].
pub fn decode_bounded<T: DeserializeOwned>(text: &str, max: usize) -> Result<T, CodecError> {
    if text.len() > max {
        return Err(CodecError::FrameTooLarge {
            size: text.len(),
            max,
        });
    }
    decode(text)
}
