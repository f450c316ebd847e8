//! `Strangers`: anonymous one-on-one text and video chat library.
//!
//! The session engine lives in [`session`]; it drives a
//! [`signaling::SignalingChannel`] and a [`negotiation::NegotiationEngine`]
//! and keeps the [`chat`] state for the presentation layer.

pub mod chat;
pub mod config;
pub mod negotiation;
pub mod session;
pub mod signaling;
