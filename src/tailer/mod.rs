//! Tailer - wires the source, buffer, flusher and liveness endpoint together
//!
//! # Lifecycle
//! 1. `prepare`: resolve configuration, build the message source
//! 2. `run`: connect, bind the liveness endpoint, spawn the tasks
//! 3. Wait for external shutdown or the first task to end
//! 4. Stop the source and wait for its workers, so every acknowledged
//!    payload is already in the buffer
//! 5. Stop the flusher (final drain and flush) and the liveness endpoint
//!
//! The first fatal error is returned; later ones are only logged.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::buffer::SharedBuffer;
use crate::common::{PipelineCounters, ShutdownReceiver, TailArgs, TailError, TailResult};
use crate::config::{ConfigWarning, FileConfig, TailConfig};
use crate::flusher::Flusher;
use crate::health::HealthServer;
use crate::source::{MessageHandler, MessageSource, RecordIngestor, SourceError};

/// Log tailer around a message source
pub struct Tailer<S> {
    config: TailConfig,
    source: Arc<S>,
    buffer: Arc<SharedBuffer>,
    counters: Arc<PipelineCounters>,
}

impl<S: MessageSource> Tailer<S> {
    /// Create a tailer from an already resolved configuration
    pub fn new(config: TailConfig, source: S) -> Self {
        Self {
            config,
            source: Arc::new(source),
            buffer: Arc::new(SharedBuffer::new()),
            counters: Arc::new(PipelineCounters::new()),
        }
    }

    /// Resolve configuration and build the source
    ///
    /// `make_source` is only called once the configuration is valid, so a
    /// configuration error never reaches the subscription.
    pub fn prepare<F>(
        args: &TailArgs,
        file: Option<FileConfig>,
        make_source: F,
    ) -> TailResult<(Self, Vec<ConfigWarning>)>
    where
        F: FnOnce(&TailConfig) -> Result<S, SourceError>,
    {
        let (config, warnings) = TailConfig::resolve(args, file)?;
        let source = make_source(&config).map_err(TailError::SubscriptionSetup)?;
        Ok((Self::new(config, source), warnings))
    }

    pub fn config(&self) -> &TailConfig {
        &self.config
    }

    /// Pipeline counters, shared with the running tasks
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until `shutdown` fires or a task fails
    pub async fn run<W>(self, output: W, mut shutdown: ShutdownReceiver) -> TailResult<()>
    where
        W: Write + Send + 'static,
    {
        self.source
            .connect()
            .await
            .map_err(TailError::SubscriptionSetup)?;
        let health = HealthServer::bind(self.config.http_port).await?;

        let (source_stop, _) = broadcast::channel::<()>(1);
        let (stop, _) = broadcast::channel::<()>(1);

        let flusher = Flusher::new(
            Arc::clone(&self.buffer),
            output,
            self.config.flush_interval,
            Arc::clone(&self.counters),
        );
        let flusher_stop = stop.subscribe();
        let mut flusher_task: JoinHandle<TailResult<()>> = tokio::spawn(async move {
            flusher.run(flusher_stop).await.map_err(TailError::Output)
        });

        let health_stop = stop.subscribe();
        let mut health_task: JoinHandle<TailResult<()>> = tokio::spawn(async move {
            health.serve(health_stop).await.map_err(TailError::Health)
        });

        let source = Arc::clone(&self.source);
        let handler: Arc<dyn MessageHandler> = Arc::new(RecordIngestor::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.counters),
        ));
        let receive_stop = source_stop.subscribe();
        let mut source_task: JoinHandle<TailResult<()>> = tokio::spawn(async move {
            source
                .receive(handler, receive_stop)
                .await
                .map_err(TailError::Delivery)
        });

        info!(
            source = self.source.name(),
            workers = self.config.receive_workers,
            flush_interval = ?self.config.flush_interval,
            "Tailer started"
        );

        let mut first_error = None;
        let mut source_done = false;
        let mut health_done = false;
        let mut flusher_done = false;

        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("Shutdown requested");
            }

            joined = &mut source_task => {
                source_done = true;
                keep_first(&mut first_error, "source", joined);
            }

            joined = &mut health_task => {
                health_done = true;
                keep_first(&mut first_error, "health", joined);
            }

            joined = &mut flusher_task => {
                flusher_done = true;
                keep_first(&mut first_error, "flusher", joined);
            }
        }

        let _ = source_stop.send(());
        if !source_done {
            keep_first(&mut first_error, "source", source_task.await);
        }

        let _ = stop.send(());
        if !flusher_done {
            keep_first(&mut first_error, "flusher", flusher_task.await);
        }
        if !health_done {
            keep_first(&mut first_error, "health", health_task.await);
        }

        let snap = self.counters.snapshot();
        info!(
            received = snap.received,
            dropped = snap.dropped,
            flushed = snap.flushed,
            lines = snap.lines,
            batches = snap.batches,
            pending = snap.pending(),
            "Tailer stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn keep_first(
    slot: &mut Option<TailError>,
    task: &'static str,
    joined: Result<TailResult<()>, JoinError>,
) {
    let result = joined.map_err(TailError::from).and_then(|r| r);
    if let Err(e) = result {
        error!(task, stage = e.stage(), error = %e, "Task failed");
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}
