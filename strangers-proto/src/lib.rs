//! Shared protocol definitions for the `Strangers` signaling wire format.

pub mod codec;
pub mod negotiation;
pub mod signal;
