//! Flusher - periodically drains the shared buffer and prints it in time order
//!
//! Cycle per tick:
//! - DRAIN: swap the buffer out (capacity hint = previous non-empty batch size)
//! - SKIP if the batch is empty
//! - SORT: stable sort by timestamp, equal timestamps keep arrival order
//! - EMIT: one line per non-empty record, flushed line by line
//!
//! On shutdown the flusher performs one last cycle so nothing already
//! acknowledged upstream is left in memory.
//!
//! Ordering only holds within a batch. A record delayed past a flush
//! boundary is printed with the next batch, after lines with later
//! timestamps.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::buffer::SharedBuffer;
use crate::common::{PipelineCounters, Record, ShutdownReceiver};

/// Stable-sort a batch by timestamp, ascending
pub fn sort_batch(batch: &mut [Record]) {
    batch.sort_by_key(|r| r.timestamp);
}

/// Write a sorted batch, one line per record with non-empty text
///
/// Each line is flushed on its own so the output interleaves correctly
/// with anything else the process writes. Returns the number of lines
/// written.
pub fn write_batch<W: Write>(out: &mut W, batch: &[Record]) -> io::Result<usize> {
    let mut lines = 0;
    for line in batch.iter().filter_map(Record::render) {
        writeln!(out, "{}", line)?;
        out.flush()?;
        lines += 1;
    }
    Ok(lines)
}

/// Drains the shared buffer on a timer and writes ordered batches
pub struct Flusher<W> {
    buffer: Arc<SharedBuffer>,
    output: W,
    interval: Duration,
    counters: Arc<PipelineCounters>,
    last_batch_len: usize,
}

impl<W: Write> Flusher<W> {
    /// Create a flusher writing to `output` every `interval`
    pub fn new(
        buffer: Arc<SharedBuffer>,
        output: W,
        interval: Duration,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            buffer,
            output,
            interval,
            counters,
            last_batch_len: 0,
        }
    }

    /// Run one drain/sort/emit cycle
    ///
    /// Returns the number of lines written; an empty buffer writes nothing.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut batch = self.buffer.drain_and_reset(self.last_batch_len);
        if batch.is_empty() {
            return Ok(0);
        }
        self.last_batch_len = batch.len();

        sort_batch(&mut batch);
        let lines = write_batch(&mut self.output, &batch)?;

        self.counters.add_batch(batch.len() as u64, lines as u64);
        debug!(records = batch.len(), lines, "Flushed batch");
        Ok(lines)
    }

    /// Give back the output stream
    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: Write + Send + 'static> Flusher<W> {
    /// Flush every interval until shutdown, then flush once more
    ///
    /// Each cycle runs on the blocking pool so a stalled output stream never
    /// holds up a runtime worker. A write error ends the loop; nothing else
    /// can.
    pub async fn run(self, mut shutdown: ShutdownReceiver) -> io::Result<()> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        info!(interval = ?self.interval, "Flusher started");

        let mut flusher = self;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Flusher received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    match flusher.flush_blocking().await {
                        Ok((returned, _)) => flusher = returned,
                        Err(e) => {
                            error!(error = %e, "Failed to write to output stream");
                            return Err(e);
                        }
                    }
                }
            }
        }

        let (_, lines) = flusher.flush_blocking().await?;
        info!(lines, "Final flush complete");
        Ok(())
    }

    /// Run one cycle in `spawn_blocking`, handing the flusher back afterwards
    async fn flush_blocking(mut self) -> io::Result<(Self, usize)> {
        tokio::task::spawn_blocking(move || -> io::Result<(Self, usize)> {
            let lines = self.flush()?;
            Ok((self, lines))
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}
