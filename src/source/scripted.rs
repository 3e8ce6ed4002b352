//! Scripted message source - replays a fixed sequence of deliveries
//!
//! Used by tests and for local runs without a Pub/Sub subscription.
//!
//! Architecture:
//! - Steps (deliver, pause, fail) live in one shared queue
//! - `workers` tasks pop steps concurrently, like subscriber workers
//! - Every delivery is recorded in the [`AckLog`] after `handle` returns
//! - Once the queue is empty the workers idle until shutdown

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{supervise_workers, MessageHandler, MessageSource, SourceError};
use crate::common::ShutdownReceiver;

#[derive(Debug, Clone)]
enum Step {
    Deliver(Vec<u8>),
    Pause(Duration),
    Fail(String),
}

type Script = Arc<Mutex<VecDeque<(usize, Step)>>>;

/// Indices of acknowledged delivery steps, in acknowledgement order
#[derive(Debug, Clone, Default)]
pub struct AckLog {
    acked: Arc<Mutex<Vec<usize>>>,
}

impl AckLog {
    fn record(&self, index: usize) {
        self.acked.lock().push(index);
    }

    /// Number of acknowledged deliveries
    pub fn len(&self) -> usize {
        self.acked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.acked.lock().is_empty()
    }

    /// Step indices acknowledged so far, sorted
    pub fn indices(&self) -> Vec<usize> {
        let mut indices = self.acked.lock().clone();
        indices.sort_unstable();
        indices
    }
}

/// Replays scripted payloads to a [`MessageHandler`]
///
/// # Example
/// ```ignore
/// let source = ScriptedSource::new()
///     .deliver_json(&json!({"textPayload": "[a]", "timestamp": "2021-03-01T12:00:00Z"}))
///     .pause(Duration::from_millis(10))
///     .deliver(b"not json".to_vec());
/// let acks = source.ack_log();
/// ```
#[derive(Debug)]
pub struct ScriptedSource {
    script: Script,
    next_index: usize,
    deliveries: usize,
    workers: usize,
    connect_error: Option<String>,
    acks: AckLog,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    /// Empty script with a single worker
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            next_index: 0,
            deliveries: 0,
            workers: 1,
            connect_error: None,
            acks: AckLog::default(),
        }
    }

    fn push(mut self, step: Step) -> Self {
        self.script.lock().push_back((self.next_index, step));
        self.next_index += 1;
        self
    }

    /// Deliver a raw payload
    pub fn deliver(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.deliveries += 1;
        self.push(Step::Deliver(payload.into()))
    }

    /// Deliver a JSON payload
    pub fn deliver_json(self, value: &serde_json::Value) -> Self {
        self.deliver(value.to_string())
    }

    /// Make the worker that picks this step wait
    pub fn pause(self, duration: Duration) -> Self {
        self.push(Step::Pause(duration))
    }

    /// End `receive` with a delivery error when this step is reached
    pub fn fail(self, reason: impl Into<String>) -> Self {
        self.push(Step::Fail(reason.into()))
    }

    /// Number of concurrent workers consuming the script
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Make `connect` fail with a subscription error
    pub fn fail_connect(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    /// Number of delivery steps in the script
    pub fn deliveries(&self) -> usize {
        self.deliveries
    }

    /// Handle on the acknowledgement log, usable after the source is moved
    pub fn ack_log(&self) -> AckLog {
        self.acks.clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self) -> Result<(), SourceError> {
        match &self.connect_error {
            Some(reason) => Err(SourceError::Status {
                status: 404,
                body: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownReceiver,
    ) -> Result<(), SourceError> {
        let (stop_tx, _) = broadcast::channel::<()>(1);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            workers.spawn(run_worker(
                worker_id,
                Arc::clone(&self.script),
                Arc::clone(&handler),
                self.acks.clone(),
                stop_tx.subscribe(),
            ));
        }

        info!(
            workers = self.workers,
            steps = self.script.lock().len(),
            "Replaying scripted deliveries"
        );

        supervise_workers(workers, stop_tx, shutdown).await
    }
}

async fn run_worker(
    worker_id: usize,
    script: Script,
    handler: Arc<dyn MessageHandler>,
    acks: AckLog,
    mut stop: ShutdownReceiver,
) -> Result<(), SourceError> {
    loop {
        if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
            return Ok(());
        }

        let next = script.lock().pop_front();
        match next {
            Some((index, Step::Deliver(payload))) => {
                handler.handle(&payload);
                acks.record(index);
                tokio::task::yield_now().await;
            }
            Some((_, Step::Pause(duration))) => {
                tokio::select! {
                    biased;
                    _ = stop.recv() => return Ok(()),
                    _ = tokio::time::sleep(duration) => {}
                }
            }
            Some((index, Step::Fail(reason))) => {
                debug!(worker_id, index, "Scripted failure reached");
                return Err(SourceError::Terminated(reason));
            }
            None => {
                debug!(worker_id, "Script exhausted, waiting for shutdown");
                let _ = stop.recv().await;
                return Ok(());
            }
        }
    }
}
