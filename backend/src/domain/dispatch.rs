//! Routing of queued jobs to their owning service.
//!
//! The dispatcher is the queue's execution callback. Outcomes and errors are
//! logged, never returned: the queue contract is at-least-once delivery and
//! every runner is idempotent, so a redelivery after a logged failure is
//! always safe.

use async_trait::async_trait;

use super::creation_job::{CreationJobService, JobRunOutcome};
use super::error::Error;
use super::landscape_job::LandscapeJobService;
use super::ports::{JobHandler, QueuedJob};
use super::trial_pool::TrialPoolService;

/// Routes each [`QueuedJob`] variant to the service that owns it.
pub struct JobDispatcher {
    creations: CreationJobService,
    landscapes: LandscapeJobService,
    trials: TrialPoolService,
}

impl JobDispatcher {
    /// Create a dispatcher over the three job runners.
    pub fn new(
        creations: CreationJobService,
        landscapes: LandscapeJobService,
        trials: TrialPoolService,
    ) -> Self {
        Self {
            creations,
            landscapes,
            trials,
        }
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn run(&self, job: QueuedJob) {
        match job {
            QueuedJob::Creation { creation_id } => {
                log_outcome("creation", self.creations.execute(creation_id).await);
            }
            QueuedJob::Trial { trial_id } => {
                log_outcome("trial", self.trials.execute(trial_id).await);
            }
            QueuedJob::Landscape { creation_id } => {
                log_outcome("landscape", self.landscapes.execute(creation_id).await);
            }
        }
    }
}

fn log_outcome(kind: &str, result: Result<JobRunOutcome, Error>) {
    match result {
        Ok(JobRunOutcome::Completed) => {
            tracing::info!(kind, "job completed");
        }
        Ok(JobRunOutcome::Failed(failure)) => {
            tracing::info!(kind, failure = failure.code(), "job reconciled as failed");
        }
        Ok(JobRunOutcome::AlreadyHandled) => {
            tracing::debug!(kind, "duplicate delivery skipped");
        }
        Ok(JobRunOutcome::NotFound) => {
            tracing::warn!(kind, "queued job references a missing row");
        }
        Err(error) => {
            // Left for redelivery; the status gate makes reruns safe.
            tracing::error!(kind, %error, "job execution failed");
        }
    }
}
