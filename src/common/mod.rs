//! Common data types shared across components
//!
//! This module defines the log record flowing through the pipeline and
//! re-exports the shared infrastructure (CLI, errors, counters, shutdown).

use chrono::{DateTime, Utc};
use serde::Deserialize;

pub mod cli;
pub use cli::TailArgs;

pub mod error;
pub use error::{TailError, TailResult};

pub mod metrics;
pub use metrics::{CounterSnapshot, PipelineCounters};

pub mod shutdown;
pub use shutdown::{setup_shutdown, ShutdownReceiver, ShutdownSender};

/// Whole-second part of the entry header timestamp
const TIMESTAMP_SECONDS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format an entry header timestamp
///
/// Fractional seconds are printed with trailing zeros removed and are left
/// out entirely on a whole second: `2021-03-01 12:00:00.5 UTC`,
/// `2021-03-01 12:00:00 UTC`.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    let mut out = timestamp.format(TIMESTAMP_SECONDS_FORMAT).to_string();
    let nanos = timestamp.timestamp_subsec_nanos() % 1_000_000_000;
    if nanos != 0 {
        let fraction = format!("{:09}", nanos);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out.push_str(" UTC");
    out
}

/// A single log line decoded from a subscription payload
///
/// Lines starting with `[` open a new log entry; any other line continues
/// the entry above it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Record {
    /// Log line text (may be empty)
    #[serde(rename = "textPayload")]
    pub text: String,
    /// Origin time of the line, used only for ordering within a batch
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Create a new record
    pub fn new(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            timestamp,
        }
    }

    /// Decode a record from a JSON log entry
    ///
    /// Unknown fields are ignored; `textPayload` and `timestamp` are required.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Whether this line opens a new multi-line entry
    #[inline]
    pub fn starts_entry(&self) -> bool {
        self.text.starts_with('[')
    }

    /// Render the output line for this record, or `None` for empty text
    pub fn render(&self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else if self.starts_entry() {
            Some(format!(
                "[{}]: {}",
                format_timestamp(&self.timestamp),
                self.text
            ))
        } else {
            Some(self.text.clone())
        }
    }
}
