//! Configuration system for the `Strangers` matchmaker.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/strangers-matchmaker/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

use crate::lobby::DEFAULT_MAX_FRAME_SIZE;

/// Errors that can occur when loading matchmaker configuration.
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

    /// The bind address is not a `host:port` socket address.
    #[error("invalid bind address {addr:?}: {reason}")]
    InvalidBindAddr {
        /// The rejected value.
        addr: String,
        /// Why it was rejected.
        reason: std::net::AddrParseError,
    },

    /// The frame limit is zero.
    #[error("max_frame_size must be greater than zero")]
    ZeroFrameSize,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the matchmaker.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MatchmakerConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the matchmaker config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the matchmaker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Strangers matchmaker")]
pub struct MatchmakerCliArgs {
    /// Address to bind the matchmaker to.
    #[arg(short, long, env = "STRANGERS_BIND")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/strangers-matchmaker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum accepted frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "STRANGERS_MATCHMAKER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved matchmaker configuration.
#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl MatchmakerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if the merged values are invalid.
    pub fn load(cli: &MatchmakerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Merge CLI args over a parsed config file (CLI > file > default) and
    /// validate the result.
    fn resolve(cli: &MatchmakerCliArgs, file: &MatchmakerConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            log_level: cli.log_level.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Err(reason) = self.bind_addr.parse::<std::net::SocketAddr>() {
            return Err(ConfigError::InvalidBindAddr {
                addr: self.bind_addr.clone(),
                reason,
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the matchmaker.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<MatchmakerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(MatchmakerConfigFile::default());
        };
        config_dir.join("strangers-matchmaker").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MatchmakerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
