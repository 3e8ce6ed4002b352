//! Top-level error type for the tailer
//!
//! Each module defines its own `thiserror` enum; `TailError` wraps them and
//! classifies which stage of the process failed. Every variant is fatal.

use thiserror::Error;

use crate::config::ConfigError;
use crate::health::HealthError;
use crate::source::SourceError;

/// Fatal tailer errors
#[derive(Error, Debug)]
pub enum TailError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The subscription could not be set up
    #[error("Subscription setup failed: {0}")]
    SubscriptionSetup(#[source] SourceError),

    /// The delivery loop terminated with an error
    #[error("Subscription receive failed: {0}")]
    Delivery(#[source] SourceError),

    /// The liveness endpoint failed
    #[error("Liveness endpoint failed: {0}")]
    Health(#[from] HealthError),

    /// Writing to the output stream failed
    #[error("Output error: {0}")]
    Output(#[from] std::io::Error),

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl TailError {
    /// Short name of the failing stage, used as a log field
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::SubscriptionSetup(_) => "subscription",
            Self::Delivery(_) => "delivery",
            Self::Health(_) => "health",
            Self::Output(_) => "output",
            Self::Task(_) => "task",
        }
    }
}

/// Result type alias using TailError
pub type TailResult<T> = Result<T, TailError>;
