//! Shared record buffer
//!
//! The one piece of shared mutable state in the pipeline. Subscriber
//! workers append records concurrently; the flusher periodically swaps the
//! whole sequence out for an empty, pre-sized one.
//!
//! The lock is held only for the push or the swap. Decoding, sorting and
//! formatting all happen outside of it.

use parking_lot::Mutex;

use crate::common::Record;

/// Mutex-guarded, growable sequence of records in arrival order
#[derive(Debug, Default)]
pub struct SharedBuffer {
    records: Mutex<Vec<Record>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record at the end of the buffer
    pub fn append(&self, record: Record) {
        self.records.lock().push(record);
    }

    /// Take every buffered record and leave an empty buffer behind
    ///
    /// The returned batch is in arrival order. The replacement storage is
    /// allocated before the lock is taken and has room for at least
    /// `capacity_hint` records, so under steady load the next window does
    /// not have to grow it. Appends racing with this call land either in
    /// the returned batch or in the new storage, never both.
    pub fn drain_and_reset(&self, capacity_hint: usize) -> Vec<Record> {
        let fresh = Vec::with_capacity(capacity_hint);
        std::mem::replace(&mut *self.records.lock(), fresh)
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.records.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn record(text: &str, secs: i64) -> Record {
        Record::new(text, Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn append_then_drain_keeps_arrival_order() {
        let buffer = SharedBuffer::new();
        buffer.append(record("[c]", 3));
        buffer.append(record("[a]", 1));
        buffer.append(record("[b]", 2));
        assert_eq!(buffer.len(), 3);

        let batch = buffer.drain_and_reset(0);
        let texts: Vec<&str> = batch.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["[c]", "[a]", "[b]"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_empty_buffer() {
        let buffer = SharedBuffer::new();
        assert!(buffer.drain_and_reset(16).is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_presizes_replacement() {
        let buffer = SharedBuffer::new();
        for i in 0..10 {
            buffer.append(record("[x]", i));
        }
        let batch = buffer.drain_and_reset(64);
        assert_eq!(batch.len(), 10);
        assert!(buffer.capacity() >= 64);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn drain_returns_only_appends_since_previous_drain() {
        let buffer = SharedBuffer::new();
        buffer.append(record("[1]", 1));
        buffer.append(record("[2]", 2));
        assert_eq!(buffer.drain_and_reset(2).len(), 2);

        buffer.append(record("[3]", 3));
        let batch = buffer.drain_and_reset(2);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].text, "[3]");
    }

    #[test]
    fn concurrent_appends_are_never_lost_or_duplicated() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 2_000;

        let buffer = Arc::new(SharedBuffer::new());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        buffer.append(record(&format!("[{p}-{i}]"), i as i64));
                    }
                })
            })
            .collect();

        let consumer_buffer = Arc::clone(&buffer);
        let consumer = thread::spawn(move || {
            let mut drained = Vec::new();
            let mut hint = 0;
            for _ in 0..200 {
                let batch = consumer_buffer.drain_and_reset(hint);
                if !batch.is_empty() {
                    hint = batch.len();
                }
                drained.extend(batch);
                thread::yield_now();
            }
            drained
        });

        for handle in producers {
            handle.join().unwrap();
        }
        let mut drained = consumer.join().unwrap();
        drained.extend(buffer.drain_and_reset(0));

        assert_eq!(drained.len(), PRODUCERS * PER_PRODUCER);
        let unique: HashSet<&str> = drained.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);
        assert!(buffer.is_empty());
    }
}
