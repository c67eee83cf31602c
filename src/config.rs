//! Configuration module for the fuzz-collector server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the collection server
#[derive(Parser, Debug, Default)]
#[command(name = "fuzz-collector")]
#[command(author = "fuzz-collector authors")]
#[command(version = "0.1.0")]
#[command(about = "Collects test run results from remote fuzzing harnesses", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind the server to [default: 0.0.0.0]
    #[arg(short = 'b', long)]
    pub bind_host: Option<IpAddr>,

    /// Port to bind the server to [default: 1337]
    #[arg(short = 'p', long)]
    pub bind_port: Option<u16>,

    /// File to store log output
    #[arg(short = 'f', long)]
    pub log_file: Option<PathBuf>,

    /// Whether to suppress printed output
    #[arg(short, long)]
    pub quiet: bool,

    #[arg(short, long, hide = true)]
    pub debug: bool,

    /// Maximum number of concurrent connection handlers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Whether to log normal test runs in addition to crashes
    #[arg(short = 'l', long)]
    pub loud: bool,

    /// Diagnostic log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub packet: PacketSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Maximum number of concurrent connection handlers
    pub workers: Option<usize>,
    /// Deadline for a peer to deliver a complete packet
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How long shutdown waits for in-flight handlers
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            workers: None,
            read_timeout_ms: default_read_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Result log and diagnostic configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Record successful runs, not only crashes
    pub log_successes: Option<bool>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: None,
            quiet: false,
            level: default_log_level(),
            log_successes: None,
        }
    }
}

/// Packet validation configuration
#[derive(Debug, Deserialize, Default)]
pub struct PacketSection {
    #[serde(default)]
    pub header_policy: HeaderPolicy,
}

/// What to do with a packet whose header is not `FUZZ`.
///
/// Both policies emit a warning entry. `Lenient` still records the
/// decoded result, `Strict` drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderPolicy {
    #[default]
    Lenient,
    Strict,
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_bind_port() -> u16 {
    1337
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Raise a filter level to at least `debug`
fn at_least_debug(level: String) -> String {
    match level.as_str() {
        "trace" | "debug" => level,
        _ => "debug".to_string(),
    }
}

/// Worker bound used when none is configured: min(32, cores + 4)
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores + 4).min(32)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: IpAddr,
    pub bind_port: u16,
    pub max_workers: usize,
    pub log_file: Option<PathBuf>,
    pub quiet: bool,
    pub debug: bool,
    pub verbose_success_logging: bool,
    pub header_policy: HeaderPolicy,
    pub read_timeout: Duration,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::from_sources(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn from_sources(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let max_workers = cli
            .workers
            .or(toml_config.server.workers)
            .filter(|&n| n > 0)
            .unwrap_or_else(default_workers);

        let mut log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };
        if cli.debug {
            log_level = at_least_debug(log_level);
        }

        Config {
            bind_host: cli.bind_host.unwrap_or(toml_config.server.bind_host),
            bind_port: cli.bind_port.unwrap_or(toml_config.server.bind_port),
            max_workers,
            log_file: cli.log_file.or(toml_config.logging.file),
            quiet: cli.quiet || toml_config.logging.quiet,
            debug: cli.debug,
            verbose_success_logging: cli.loud
                || toml_config.logging.log_successes.unwrap_or(true),
            header_policy: toml_config.packet.header_policy,
            read_timeout: Duration::from_millis(toml_config.server.read_timeout_ms),
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            log_level,
        }
    }

    /// Socket address the listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.bind_port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
