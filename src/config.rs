//! Configuration module for the line bridge.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::line::ACK_OVERHEAD;
use clap::Parser;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the line bridge
#[derive(Parser, Debug)]
#[command(name = "line-bridge")]
#[command(author = "line-bridge authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-client TCP line server feeding a telemetry sink", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to bind to (e.g., 192.168.100.10)
    #[arg(short, long)]
    pub address: Option<Ipv4Addr>,

    /// TCP port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog size
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Line buffer capacity in bytes (longest line is one less)
    #[arg(long)]
    pub line_capacity: Option<usize>,

    /// Do not acknowledge received lines back to the client
    #[arg(long)]
    pub no_echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening endpoint configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IPv4 address to bind to
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// What to do when the active client closes its side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerClosePolicy {
    /// Escalate to a server stop with `StopReason::ClientClosed`.
    Stop,
    /// Close the client only and keep listening.
    Release,
}

/// Per-client session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Line buffer capacity, including room for the terminator
    #[serde(default = "default_line_capacity")]
    pub line_capacity: usize,
    /// Acknowledge each received line back to the client
    #[serde(default = "default_echo")]
    pub echo: bool,
    /// Behavior on a clean close by the peer
    #[serde(default = "default_peer_close")]
    pub peer_close: PeerClosePolicy,
    /// Ceiling on queued outbound bytes
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_capacity: default_line_capacity(),
            echo: default_echo(),
            peer_close: default_peer_close(),
            max_pending_output: default_max_pending_output(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum events drained per poll wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Start a fresh listener after the client closes the connection
    #[serde(default = "default_restart_on_client_close")]
    pub restart_on_client_close: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            events_capacity: default_events_capacity(),
            restart_on_client_close: default_restart_on_client_close(),
        }
    }
}

/// Where completed lines are forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Structured log events on the `telemetry` target
    Log,
    /// One JSON object per line on stdout
    Stdout,
}

/// Telemetry sink configuration
#[derive(Debug, Deserialize)]
pub struct TelemetryConfig {
    /// Property name each line is reported under
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Sink implementation
    #[serde(default = "default_sink")]
    pub sink: SinkKind,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            tag: default_tag(),
            sink: default_sink(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_address() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_port() -> u16 {
    11000
}

fn default_backlog() -> i32 {
    1
}

fn default_line_capacity() -> usize {
    256
}

fn default_echo() -> bool {
    true
}

fn default_peer_close() -> PeerClosePolicy {
    PeerClosePolicy::Stop
}

fn default_max_pending_output() -> usize {
    4096
}

fn default_events_capacity() -> usize {
    128
}

fn default_restart_on_client_close() -> bool {
    true
}

fn default_tag() -> String {
    "sendToCloud".to_string()
}

fn default_sink() -> SinkKind {
    SinkKind::Log
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: Ipv4Addr,
    pub port: u16,
    pub backlog: i32,
    pub line_capacity: usize,
    pub echo: bool,
    pub peer_close: PeerClosePolicy,
    pub max_pending_output: usize,
    pub events_capacity: usize,
    pub restart_on_client_close: bool,
    pub telemetry_tag: String,
    pub telemetry_sink: SinkKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["line-bridge"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            address: cli.address.unwrap_or(toml_config.server.address),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            line_capacity: cli
                .line_capacity
                .unwrap_or(toml_config.session.line_capacity),
            echo: !cli.no_echo && toml_config.session.echo,
            peer_close: toml_config.session.peer_close,
            max_pending_output: toml_config.session.max_pending_output,
            events_capacity: toml_config.runtime.events_capacity,
            restart_on_client_close: toml_config.runtime.restart_on_client_close,
            telemetry_tag: toml_config.telemetry.tag,
            telemetry_sink: toml_config.telemetry.sink,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.line_capacity < 2 {
            return Err(ConfigError::Invalid(format!(
                "line_capacity must be at least 2, got {}",
                self.line_capacity
            )));
        }
        if self.backlog < 1 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be at least 1, got {}",
                self.backlog
            )));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_pending_output == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_output must be at least 1".to_string(),
            ));
        }
        let max_ack = self.line_capacity - 1 + ACK_OVERHEAD;
        if self.echo && self.max_pending_output < max_ack {
            return Err(ConfigError::Invalid(format!(
                "max_pending_output must hold the acknowledgement of a full line \
                 ({max_ack} bytes for line_capacity {}), got {}",
                self.line_capacity, self.max_pending_output
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
