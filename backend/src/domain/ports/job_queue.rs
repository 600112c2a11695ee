//! Port for asynchronous job dispatch.
//!
//! `enqueue` decouples submission from execution: it returns immediately and
//! the job runs after the caller's current unit of work completes, so the
//! durable `Creating` row always exists before execution starts. Delivery is
//! at-least-once; the execute entry points' status gates make duplicates
//! safe. Payloads carry ids only, never blobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::identity::{CreationId, TrialId};

/// Minimal payload identifying one queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedJob {
    /// Authenticated creation job.
    Creation {
        /// Row to execute.
        creation_id: CreationId,
    },
    /// Anonymous trial job.
    Trial {
        /// Row to execute.
        trial_id: TrialId,
    },
    /// Landscape generation attached to an existing creation.
    Landscape {
        /// Creation whose landscape sub-state is in flight.
        creation_id: CreationId,
    },
}

/// Errors raised by queue adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobDispatchError {
    /// Queue infrastructure is unavailable.
    #[error("job queue is unavailable: {message}")]
    Unavailable { message: String },
    /// The job could not be acknowledged or persisted.
    #[error("job was rejected: {message}")]
    Rejected { message: String },
}

impl JobDispatchError {
    /// Helper for queue outages.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Helper for rejected jobs.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Port for handing a job to the scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Accept `job` for asynchronous execution and return immediately.
    async fn enqueue(&self, job: QueuedJob) -> Result<(), JobDispatchError>;
}

/// Execution callback contract the queue delivers jobs to.
///
/// Implementations must tolerate duplicate delivery; ordinary job failures
/// are reconciled into durable state and never propagate out of `run`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one delivered job.
    async fn run(&self, job: QueuedJob);
}

/// Fixture queue that accepts and discards jobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureJobQueue;

#[async_trait]
impl JobQueue for FixtureJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), JobDispatchError> {
        tracing::debug!(?job, "fixture queue discarded job");
        Ok(())
    }
}
