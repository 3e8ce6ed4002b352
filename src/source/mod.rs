//! Message sources - deliver encoded log payloads to the pipeline
//!
//! Architecture:
//! - [`MessageSource`]: polymorphic delivery mechanism (Pub/Sub, scripted)
//! - [`MessageHandler`]: callback invoked concurrently by source workers
//! - [`RecordIngestor`]: the pipeline's handler, decode → buffer
//!
//! Contract every source upholds: a payload is acknowledged only after
//! `handle` has returned for it, and undecodable payloads are acknowledged
//! like any other.

pub mod pubsub;
pub mod scripted;

pub use pubsub::{PubSubConfig, PubSubSource};
pub use scripted::{AckLog, ScriptedSource};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::buffer::SharedBuffer;
use crate::common::{PipelineCounters, Record, ShutdownReceiver};

/// Message source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Subscription terminated: {0}")]
    Terminated(String),

    #[error("Receive worker failed: {0}")]
    Worker(String),
}

impl SourceError {
    /// Whether the delivery mechanism should retry after this error
    ///
    /// Connection problems, timeouts, throttling and server errors are
    /// transient. Everything else (permission denied, subscription not
    /// found, bad request) ends the receive loop.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Auth(_) | Self::Terminated(_) | Self::Worker(_) => false,
        }
    }
}

/// Callback invoked for every delivered payload
///
/// May be called concurrently from every worker of a source. Returning
/// means the payload has been dealt with and can be acknowledged.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: &[u8]);
}

/// A delivery mechanism feeding payloads to a [`MessageHandler`]
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Verify the subscription is usable before any worker starts
    async fn connect(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Deliver payloads to `handler` until shutdown or a fatal error
    ///
    /// Returns `Ok(())` once `shutdown` fires and every worker has stopped.
    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownReceiver,
    ) -> Result<(), SourceError>;
}

/// Wait for shutdown or the first failing worker
///
/// On shutdown `stop` is broadcast and every worker is awaited. The first
/// worker error aborts the others and is returned. Workers subscribe to
/// `stop` before this is called, so a shutdown racing with startup is
/// never missed.
pub(crate) async fn supervise_workers(
    mut workers: JoinSet<Result<(), SourceError>>,
    stop: broadcast::Sender<()>,
    mut shutdown: ShutdownReceiver,
) -> Result<(), SourceError> {
    let outcome = loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = stop.send(());
                break Ok(());
            }

            joined = workers.join_next() => match joined {
                None => break Ok(()),
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(SourceError::Worker(e.to_string())),
            },
        }
    };

    match outcome {
        Ok(()) => {
            while let Some(joined) = workers.join_next().await {
                if let Ok(Err(e)) = joined {
                    debug!(error = %e, "Worker failed during shutdown");
                }
            }
            Ok(())
        }
        Err(e) => {
            workers.abort_all();
            Err(e)
        }
    }
}

/// The pipeline's message handler: decodes payloads into the shared buffer
///
/// Undecodable payloads are dropped silently; the `dropped` counter and a
/// trace event are the only signs of them.
pub struct RecordIngestor {
    buffer: Arc<SharedBuffer>,
    counters: Arc<PipelineCounters>,
}

impl RecordIngestor {
    pub fn new(buffer: Arc<SharedBuffer>, counters: Arc<PipelineCounters>) -> Self {
        Self { buffer, counters }
    }
}

impl MessageHandler for RecordIngestor {
    fn handle(&self, payload: &[u8]) {
        self.counters.inc_received();
        match Record::from_json(payload) {
            Ok(record) => {
                self.buffer.append(record);
                self.counters.inc_buffered();
            }
            Err(e) => {
                self.counters.inc_dropped();
                trace!(error = %e, bytes = payload.len(), "Dropping undecodable payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingestor() -> (RecordIngestor, Arc<SharedBuffer>, Arc<PipelineCounters>) {
        let buffer = Arc::new(SharedBuffer::new());
        let counters = Arc::new(PipelineCounters::new());
        (
            RecordIngestor::new(Arc::clone(&buffer), Arc::clone(&counters)),
            buffer,
            counters,
        )
    }

    #[test]
    fn ingest_valid_payload() {
        let (ingestor, buffer, counters) = ingestor();
        ingestor.handle(br#"{"textPayload": "[a]", "timestamp": "2021-03-01T12:00:00Z"}"#);

        assert_eq!(buffer.len(), 1);
        let snap = counters.snapshot();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.buffered, 1);
        assert_eq!(snap.dropped, 0);
    }

    #[test]
    fn ingest_malformed_payload_is_dropped() {
        let (ingestor, buffer, counters) = ingestor();
        ingestor.handle(b"{\"textPayload\": ");
        ingestor.handle(br#"{"jsonPayload": {"k": "v"}, "timestamp": "2021-03-01T12:00:00Z"}"#);

        assert!(buffer.is_empty());
        let snap = counters.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.dropped, 2);
    }

    #[test]
    fn status_errors_classified() {
        let transient = |status| SourceError::Status {
            status,
            body: String::new(),
        };
        assert!(transient(503).is_transient());
        assert!(transient(500).is_transient());
        assert!(transient(429).is_transient());
        assert!(!transient(403).is_transient());
        assert!(!transient(404).is_transient());
        assert!(!SourceError::Auth("no token".into()).is_transient());
        assert!(!SourceError::Terminated("gone".into()).is_transient());
    }
}
