//! CLI argument parsing
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Every value is optional here; defaults and validation live in
//!   [`crate::config::TailConfig::resolve`] so a TOML file can fill the gaps

use std::time::Duration;

use clap::Parser;

/// Arguments for the tailer binary
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "cloudsqltail",
    version,
    about = "Tail Cloud SQL logs from a Pub/Sub subscription to stdout"
)]
pub struct TailArgs {
    /// Path to an optional TOML configuration file (CLI values take precedence)
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<String>,

    /// GCP project ID
    #[arg(long)]
    pub project: Option<String>,

    /// Pub/Sub subscription name
    #[arg(long)]
    pub subscription: Option<String>,

    /// Number of workers receiving from the subscription [default: number of CPUs]
    #[arg(long = "recv-routines", allow_negative_numbers = true)]
    pub recv_routines: Option<i64>,

    /// Time between flushes of buffered records to stdout (e.g. "5s", "500ms") [default: 5s]
    #[arg(long = "flush-interval", value_parser = humantime::parse_duration)]
    pub flush_interval: Option<Duration>,

    /// Port of the liveness HTTP endpoint [default: 5000]
    #[arg(long = "http-port")]
    pub http_port: Option<u16>,

    /// Maximum number of messages returned by a single pull [default: 1000]
    #[arg(long = "max-messages")]
    pub max_messages: Option<u32>,

    /// Pub/Sub emulator address (host:port); disables authentication
    #[arg(long = "emulator-host", env = "PUBSUB_EMULATOR_HOST")]
    pub emulator_host: Option<String>,
}
