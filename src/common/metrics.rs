//! Pipeline counters
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters, never touched under the buffer lock
//! - Simple snapshot mechanism for reporting
//! - The `dropped` counter is the only trace left by undecodable payloads

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the subscriber workers and the flusher
///
/// All operations use Relaxed ordering; values are eventually consistent,
/// which is acceptable for reporting.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// Payloads handed to the pipeline by the message source
    pub received: AtomicU64,
    /// Records appended to the shared buffer
    pub buffered: AtomicU64,
    /// Payloads discarded because they could not be decoded
    pub dropped: AtomicU64,
    /// Records drained and written by the flusher (including empty ones)
    pub flushed: AtomicU64,
    /// Lines written to the output stream
    pub lines: AtomicU64,
    /// Non-empty batches flushed
    pub batches: AtomicU64,
}

impl PipelineCounters {
    /// Create new zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one flushed batch
    #[inline]
    pub fn add_batch(&self, records: u64, lines: u64) {
        self.flushed.fetch_add(records, Ordering::Relaxed);
        self.lines.fetch_add(lines, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub received: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub lines: u64,
    pub batches: u64,
}

impl CounterSnapshot {
    /// Records buffered but not yet flushed
    pub fn pending(&self) -> u64 {
        self.buffered.saturating_sub(self.flushed)
    }
}
