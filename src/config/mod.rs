//! Configuration for the tailer
//!
//! Supports loading configuration from:
//! - Command-line flags ([`TailArgs`])
//! - An optional TOML file ([`FileConfig`]); flags override file values
//!
//! # Example
//! ```ignore
//! let file = args.config_file.as_deref().map(FileConfig::load).transpose()?;
//! let (config, warnings) = TailConfig::resolve(&args, file)?;
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::common::TailArgs;

/// Flush interval used when none is configured
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Liveness endpoint port used when none is configured
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Worker count used when the configured one is not positive
pub const DEFAULT_SOURCE_WORKERS: usize = 10;

/// Messages requested per pull when none is configured
pub const DEFAULT_MAX_MESSAGES: u32 = 1000;

/// Flush intervals below this produce a warning
const SHORT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("must provide --{0}")]
    MissingField(&'static str),

    #[error("flush interval '{0:?}' must be > 0")]
    InvalidFlushInterval(Duration),

    #[error("invalid value for --{field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Non-fatal configuration issues, logged at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Worker count was zero or negative; the source default is used instead
    NonPositiveWorkers { requested: i64, fallback: usize },
    /// Flush interval under one second
    ShortFlushInterval(Duration),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveWorkers {
                requested,
                fallback,
            } => write!(
                f,
                "cannot have \"{}\" receive workers, using default value of \"{}\"",
                requested, fallback
            ),
            Self::ShortFlushInterval(interval) => write!(
                f,
                "a flush interval of {} may result in more out-of-order output",
                humantime::format_duration(*interval)
            ),
        }
    }
}

/// Values read from the optional TOML configuration file
///
/// ```toml
/// project = "my-project"
/// subscription = "cloudsql-logs"
/// recv_routines = 8
/// flush_interval = "5s"
/// http_port = 5000
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub recv_routines: Option<i64>,
    #[serde(default, with = "humantime_serde")]
    pub flush_interval: Option<Duration>,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub max_messages: Option<u32>,
    #[serde(default)]
    pub emulator_host: Option<String>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Fully resolved and validated tailer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailConfig {
    /// GCP project ID
    pub project: String,
    /// Subscription name (short name or full `projects/.../subscriptions/...` path)
    pub subscription: String,
    /// Number of concurrent receive workers
    pub receive_workers: usize,
    /// Time between flushes
    pub flush_interval: Duration,
    /// Liveness endpoint port (0 picks an ephemeral port)
    pub http_port: u16,
    /// Maximum messages per pull request
    pub max_messages: u32,
    /// Pub/Sub emulator address, if any
    pub emulator_host: Option<String>,
}

impl TailConfig {
    /// Merge CLI arguments over file values, apply defaults and validate
    ///
    /// Returns the configuration together with any warnings that should be
    /// logged before starting.
    pub fn resolve(
        args: &TailArgs,
        file: Option<FileConfig>,
    ) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let file = file.unwrap_or_default();
        let mut warnings = Vec::new();

        let project = required(args.project.clone().or(file.project), "project")?;
        let subscription = required(
            args.subscription.clone().or(file.subscription),
            "subscription",
        )?;

        let receive_workers = match args.recv_routines.or(file.recv_routines) {
            Some(n) if n >= 1 => n as usize,
            Some(n) => {
                warnings.push(ConfigWarning::NonPositiveWorkers {
                    requested: n,
                    fallback: DEFAULT_SOURCE_WORKERS,
                });
                DEFAULT_SOURCE_WORKERS
            }
            None => available_cpus(),
        };

        let flush_interval = args
            .flush_interval
            .or(file.flush_interval)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL);
        if flush_interval.is_zero() {
            return Err(ConfigError::InvalidFlushInterval(flush_interval));
        }
        if flush_interval < SHORT_FLUSH_INTERVAL {
            warnings.push(ConfigWarning::ShortFlushInterval(flush_interval));
        }

        let max_messages = args
            .max_messages
            .or(file.max_messages)
            .unwrap_or(DEFAULT_MAX_MESSAGES);
        if max_messages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max-messages",
                reason: "must be > 0".to_string(),
            });
        }

        let config = Self {
            project,
            subscription,
            receive_workers,
            flush_interval,
            http_port: args.http_port.or(file.http_port).unwrap_or(DEFAULT_HTTP_PORT),
            max_messages,
            emulator_host: args
                .emulator_host
                .clone()
                .or(file.emulator_host)
                .filter(|h| !h.trim().is_empty()),
        };

        Ok((config, warnings))
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingField(field))
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
