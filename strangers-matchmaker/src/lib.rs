//! `Strangers` matchmaker library.
//!
//! Exposes the matchmaker for use in tests and embedding. The matchmaker
//! accepts WebSocket connections, pairs clients that ask for the same
//! keyword, and relays chat and negotiation frames between partners.

pub mod config;
pub mod lobby;
pub mod server;
