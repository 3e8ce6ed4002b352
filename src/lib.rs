//! cloudsqltail-rs: Cloud SQL log tailer
//!
//! Receives Cloud SQL log entries from a Pub/Sub subscription, buffers
//! them, and periodically prints each batch to stdout ordered by timestamp
//! so multi-line PostgreSQL entries are reassembled for a log shipper.

pub mod buffer;
pub mod common;
pub mod config;
pub mod flusher;
pub mod health;
pub mod source;
pub mod tailer;
