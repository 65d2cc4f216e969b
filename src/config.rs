use std::fs::read_to_string;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

/// One bound TCP interface (spec §4.1 "binding vs. remote address").
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    ///
    /// Address to bind and listen on, e.g. `127.0.0.1:35216`.
    ///
    pub bind: String,
    ///
    /// How long a session may go without a new frame starting to arrive
    /// before it is treated as dead.
    ///
    #[serde(default = "InterfaceConfig::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl InterfaceConfig {
    fn idle_timeout_secs() -> u64 {
        20
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

/// A peer to dial on startup (spec §4.2 "connect delegate").
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfig {
    pub address: String,
    ///
    /// Hex-encoded identifier, when the peer is known in advance. Left
    /// unset, the peer's identity is learned from the handshake's first
    /// frame instead.
    ///
    #[serde(default)]
    pub identifier: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectConfig {
    #[serde(default = "ConnectConfig::timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "ConnectConfig::retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "ConnectConfig::retry_limit")]
    pub retry_limit: u32,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl ConnectConfig {
    fn timeout_secs() -> u64 {
        15
    }

    fn retry_interval_secs() -> u64 {
        5
    }

    fn retry_limit() -> u32 {
        3
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::timeout_secs(),
            retry_interval_secs: Self::retry_interval_secs(),
            retry_limit: Self::retry_limit(),
            peers: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TrackingConfig {
    #[serde(default = "TrackingConfig::expiration_ms")]
    pub expiration_ms: u64,
}

impl TrackingConfig {
    fn expiration_ms() -> u64 {
        1500
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            expiration_ms: Self::expiration_ms(),
        }
    }
}

/// A node's identity seed. Left unset, a fresh random identifier is
/// generated at startup and logged once so operators can record it.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    #[serde(default)]
    pub identifier_seed: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: mesh-node --config /etc/mesh-node/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Loads configuration from the file named by `--config`.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(Cli::parse().config)?)?)
    }
}
