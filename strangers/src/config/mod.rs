//! Configuration system for the `Strangers` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/strangers/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::negotiation::peer::IceServer;
use crate::session::SessionMode;
use crate::signaling::ws::WsOptions;

/// Default matchmaker endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:9000/ws";

/// Default discovery server.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The matchmaker URL is not a `ws://` or `wss://` URL.
    #[error("invalid server URL {url}: {reason}")]
    InvalidServerUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An ICE server entry is unusable.
    #[error("invalid ICE server {url}: {reason}")]
    InvalidIceServer {
        /// The offending URL (or `<empty>` for an entry without URLs).
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    rtc: RtcFileConfig,
    media: MediaFileConfig,
    session: SessionFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[rtc]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RtcFileConfig {
    ice_servers: Option<Vec<IceServer>>,
}

/// `[media]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MediaFileConfig {
    capture_enabled: Option<bool>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    keyword: Option<String>,
    mode: Option<SessionMode>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Matchmaker WebSocket URL.
    pub server_url: String,
    /// Timeout for connecting to the matchmaker.
    pub connect_timeout: Duration,
    /// Timeout for the matchmaker's `welcome` frame.
    pub handshake_timeout: Duration,
    /// Capacity of the inbound event channel.
    pub channel_capacity: usize,

    // -- RTC --
    /// Discovery/relay servers for peer connections.
    pub ice_servers: Vec<IceServer>,

    // -- Media --
    /// Whether local capture may be started for video sessions.
    pub capture_enabled: bool,

    // -- Session --
    /// Keyword used by `/text` and `/video` when none is typed.
    pub keyword: String,
    /// Mode used when a match is requested without choosing one.
    pub mode: SessionMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            capture_enabled: true,
            keyword: String::new(),
            mode: SessionMode::Text,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/strangers/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if the resolved server URL or ICE servers are invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.network.server_url.clone())
                .unwrap_or(defaults.server_url),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: file
                .network
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            ice_servers: file
                .rtc
                .ice_servers
                .clone()
                .unwrap_or(defaults.ice_servers),
            capture_enabled: file
                .media
                .capture_enabled
                .unwrap_or(defaults.capture_enabled),
            keyword: cli
                .keyword
                .clone()
                .or_else(|| file.session.keyword.clone())
                .unwrap_or(defaults.keyword),
            mode: if cli.video {
                SessionMode::Video
            } else {
                file.session.mode.unwrap_or(defaults.mode)
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the server URL and every ICE server entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServerUrl`] or
    /// [`ConfigError::InvalidIceServer`] for the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed =
            url::Url::parse(&self.server_url).map_err(|e| ConfigError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: e.to_string(),
            })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        for server in &self.ice_servers {
            validate_ice_server(server)?;
        }
        Ok(())
    }

    /// Connection tuning for the WebSocket signaling channel.
    #[must_use]
    pub fn to_ws_options(&self) -> WsOptions {
        WsOptions {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            channel_capacity: self.channel_capacity,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Anonymous one-on-one chat with strangers")]
pub struct CliArgs {
    /// WebSocket URL of the matchmaker.
    #[arg(long, env = "STRANGERS_SERVER_URL")]
    pub server_url: Option<String>,

    /// Path to config file (default: `~/.config/strangers/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interest keyword used when `/text` or `/video` is typed without one.
    #[arg(short, long)]
    pub keyword: Option<String>,

    /// Prefer video sessions.
    #[arg(long)]
    pub video: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "STRANGERS_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/strangers.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn validate_ice_server(server: &IceServer) -> Result<(), ConfigError> {
    if server.urls.is_empty() {
        return Err(ConfigError::InvalidIceServer {
            url: "<empty>".to_string(),
            reason: "no URLs".to_string(),
        });
    }
    for url in &server.urls {
        let Some((scheme, rest)) = url.split_once(':') else {
            return Err(ConfigError::InvalidIceServer {
                url: url.clone(),
                reason: "missing scheme".to_string(),
            });
        };
        if rest.is_empty() {
            return Err(ConfigError::InvalidIceServer {
                url: url.clone(),
                reason: "missing host".to_string(),
            });
        }
        match scheme {
            "stun" | "stuns" => {}
            "turn" | "turns" => {
                if server.username.is_none() || server.credential.is_none() {
                    return Err(ConfigError::InvalidIceServer {
                        url: url.clone(),
                        reason: "TURN servers need a username and credential".to_string(),
                    });
                }
            }
            other => {
                return Err(ConfigError::InvalidIceServer {
                    url: url.clone(),
                    reason: format!("unsupported scheme '{other}'"),
                });
            }
        }
    }
    Ok(())
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("strangers").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
