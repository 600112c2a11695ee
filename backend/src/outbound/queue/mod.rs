//! In-process Tokio job queue adapter.
//!
//! `enqueue` hands the job to an unbounded channel and returns immediately;
//! a worker task started once at wiring time delivers each job to the
//! [`JobHandler`] on its own task so one slow provider call never blocks the
//! rest of the queue. Delivery is at-least-once from the runners' point of
//! view, so the handler must stay idempotent.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::ports::{JobDispatchError, JobHandler, JobQueue, QueuedJob};

/// Channel-backed queue delivering jobs to a single handler.
pub struct TokioJobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueuedJob>>>,
}

impl TokioJobQueue {
    /// Create an idle queue. Jobs enqueued before [`Self::start`] are
    /// buffered and delivered once the worker runs.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Start the delivery worker. The queue is constructed before the
    /// handler so the two can reference each other; calling `start` a second
    /// time is a no-op returning `None`.
    pub fn start(&self, handler: Arc<dyn JobHandler>) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())?;
        Some(tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler.run(job).await;
                });
            }
        }))
    }
}

impl Default for TokioJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for TokioJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), JobDispatchError> {
        self.sender
            .send(job)
            .map_err(|_| JobDispatchError::unavailable("job worker has shut down"))
    }
}
