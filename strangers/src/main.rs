//! `Strangers`: anonymous one-on-one text and video chat.
//!
//! Connects to a matchmaker and runs a line-oriented chat on stdin/stdout.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/strangers/config.toml`).
//!
//! ```bash
//! # Against a local matchmaker
//! cargo run --bin strangers
//!
//! # Elsewhere, preferring video, matching on a keyword
//! cargo run --bin strangers -- --server-url wss://chat.example.com/ws \
//!     --video --keyword music
//! ```
//!
//! Commands: `/start [keyword]`, `/text [keyword]`, `/video [keyword]`,
//! `/next`, `/end`, `/typing`, `/stop`, `/quit`. An empty line also clears
//! the typing indicator. Any other line is sent to the stranger.

use std::io;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use strangers::chat::{Message, Sender};
use strangers::config::{CliArgs, ClientConfig};
use strangers::negotiation::rtc::WebRtcBackend;
use strangers::session::{ENDED_NOTICE, SessionController, SessionMode};
use strangers::signaling::ws::WsSignalingChannel;

type Controller = SessionController<WsSignalingChannel, WebRtcBackend>;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load configuration: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so stdout stays free for the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(server = %config.server_url, "strangers starting");

    let channel = match WsSignalingChannel::connect(&config.server_url, &config.to_ws_options()).await
    {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("Could not reach the server: {e}");
            std::process::exit(1);
        }
    };
    let backend = match WebRtcBackend::new(config.capture_enabled) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Failed to initialise media: {e}");
            std::process::exit(1);
        }
    };

    let mut controller = SessionController::new(channel, backend, config.ice_servers.clone());
    print_help();

    let result = run(&mut controller, &config).await;
    tracing::info!("strangers exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("strangers.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Main loop: one stdin line or one inbound item at a time.
async fn run(controller: &mut Controller, config: &ClientConfig) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut screen = Screen::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let command = Command::parse(&line);
                if command == Command::Quit {
                    break;
                }
                execute(controller, config, command).await;
            }
            input = controller.next_input() => {
                if let Err(e) = controller.handle_input(input).await {
                    tracing::warn!(error = %e, "inbound item failed");
                }
            }
        }
        screen.render(controller);
    }

    if let Err(e) = controller.end().await {
        tracing::debug!(error = %e, "could not notify the matchmaker on exit");
    }
    Ok(())
}

async fn execute(controller: &mut Controller, config: &ClientConfig, command: Command) {
    let result = match command {
        Command::Start(keyword) => {
            let keyword = keyword.unwrap_or_else(|| config.keyword.clone());
            controller.request_match(config.mode, &keyword).await
        }
        Command::Text(keyword) => {
            let keyword = keyword.unwrap_or_else(|| config.keyword.clone());
            controller.request_match(SessionMode::Text, &keyword).await
        }
        Command::Video(keyword) => {
            let keyword = keyword.unwrap_or_else(|| config.keyword.clone());
            controller.request_match(SessionMode::Video, &keyword).await
        }
        Command::Next => controller.next().await,
        Command::End => {
            print_line(&Message::system(ENDED_NOTICE));
            controller.end().await
        }
        Command::Typing => controller.notify_typing().await,
        Command::StopTyping => controller.notify_stop_typing().await,
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Unknown(name) => {
            println!("Unknown command /{name}. Type /help for the list.");
            Ok(())
        }
        Command::Say(text) => controller.send_message(&text).await,
        Command::Quit => Ok(()),
    };
    if let Err(e) = result {
        println!("{e}");
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start(Option<String>),
    Text(Option<String>),
    Video(Option<String>),
    Next,
    End,
    Typing,
    StopTyping,
    Help,
    Quit,
    Unknown(String),
    Say(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        if line.trim().is_empty() {
            return Self::StopTyping;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Say(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim().to_string()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };
        match name {
            "start" => Self::Start(arg),
            "text" => Self::Text(arg),
            "video" => Self::Video(arg),
            "next" => Self::Next,
            "end" => Self::End,
            "typing" => Self::Typing,
            "stop" => Self::StopTyping,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

fn print_help() {
    println!("/start [keyword]  find a stranger (configured mode)");
    println!("/text [keyword]   find a stranger for text chat");
    println!("/video [keyword]  find a stranger for video chat");
    println!("/next             skip to the next stranger");
    println!("/end              end the chat");
    println!("/typing           tell the stranger you are typing");
    println!("/stop             tell the stranger you stopped typing (or an empty line)");
    println!("/quit             leave");
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What has already been printed, so only changes are written.
#[derive(Default)]
struct Screen {
    printed: Vec<Message>,
    typing: bool,
    online: Option<u64>,
}

impl Screen {
    fn render(&mut self, controller: &Controller) {
        let entries = controller.chat_log().entries();
        // A log that no longer extends what was printed belongs to a new session.
        let start = if entries.starts_with(&self.printed) {
            self.printed.len()
        } else {
            0
        };
        for message in &entries[start..] {
            print_line(message);
        }
        self.printed = entries.to_vec();

        let typing = controller.is_stranger_typing();
        if typing && !self.typing {
            println!("{} Stranger is typing...", timestamp());
        }
        self.typing = typing;

        let online = controller.online_count();
        if online != self.online {
            if let Some(count) = online {
                println!("{} {count} strangers online", timestamp());
            }
            self.online = online;
        }
    }
}

fn print_line(message: &Message) {
    match message.sender {
        Sender::System => println!("{} * {}", timestamp(), message.text),
        sender => println!("{} {sender}: {}", timestamp(), message.text),
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}
