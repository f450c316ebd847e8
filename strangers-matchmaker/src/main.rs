//! `Strangers` matchmaker: pairs anonymous clients by keyword.
//!
//! An axum WebSocket server that queues clients asking for a stranger,
//! pairs those sharing a keyword, and relays chat, typing and negotiation
//! frames between partners.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin strangers-matchmaker
//!
//! # Run on custom address
//! cargo run --bin strangers-matchmaker -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;

use clap::Parser;
use strangers_matchmaker::config::{MatchmakerCliArgs, MatchmakerConfig};
use strangers_matchmaker::lobby::Lobby;
use strangers_matchmaker::server;

#[tokio::main]
async fn main() {
    let cli = MatchmakerCliArgs::parse();

    let config = match MatchmakerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting strangers matchmaker");

    let lobby = Arc::new(Lobby::with_max_frame_size(config.max_frame_size));

    match server::start_server_with_state(&config.bind_addr, lobby).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "matchmaker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "matchmaker task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start matchmaker");
            std::process::exit(1);
        }
    }
}
