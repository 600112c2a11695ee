//! Anonymous trial submissions backed by a small per-prompt result pool.
//!
//! Trials are unpaid, keyed by an anonymous client identity, and cached: the
//! pool for a prompt is the set of recently completed trial rows for that
//! exact prompt. A cache hit links the caller to one pooled result picked
//! uniformly at random and tops the pool back up in the background under the
//! reserved pool identity. Stored files are shared between requests and only
//! deleted once the last referencing request discards them.

use std::sync::Arc;

use chrono::TimeDelta;
use mockable::Clock;
use rand::Rng;
use serde_json::{Map, Value};

use crate::config::JobPipelineConfig;

use super::creation::{
    CompletionUpdate, CreationMetadata, CreationStatus, JobFailure, placeholder_filename,
};
use super::creation_job::{
    JobRunOutcome, map_dispatch_error, map_provider_repository_error,
};
use super::error::Error;
use super::generation::{GenerationDeps, artifact_filename, run_generation};
use super::identity::{ClientId, ProviderId, TrialId, TrialRequestId};
use super::ports::{
    ImageNormalizer, JobQueue, Provider, ProviderGateway, ProviderRepository, QueuedJob,
    StorageSink, TrialRepository, TrialRepositoryError,
};
use super::trial::{NewTrialCreation, NewTrialRequest, TrialCreation, TrialRequest};

pub(crate) fn map_trial_repository_error(error: TrialRepositoryError) -> Error {
    match error {
        TrialRepositoryError::Connection { message } => {
            Error::service_unavailable(format!("trial repository unavailable: {message}"))
        }
        TrialRepositoryError::Query { message } => {
            Error::internal(format!("trial repository error: {message}"))
        }
    }
}

/// Port bundle required by the trial pool.
#[derive(Clone)]
pub struct TrialPoolPorts {
    /// Trial creation and request persistence.
    pub trials: Arc<dyn TrialRepository>,
    /// Provider lookup.
    pub providers: Arc<dyn ProviderRepository>,
    /// Outbound generation call.
    pub gateway: Arc<dyn ProviderGateway>,
    /// Canonical format conversion.
    pub normalizer: Arc<dyn ImageNormalizer>,
    /// Artifact blob storage.
    pub storage: Arc<dyn StorageSink>,
    /// Asynchronous job dispatch.
    pub queue: Arc<dyn JobQueue>,
}

/// Submission request for one anonymous trial.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitTrialRequest {
    /// Anonymous client identity.
    pub client_id: ClientId,
    /// Prompt to generate for; also the pool cache key.
    pub prompt: String,
    /// Target provider for a fresh generation.
    pub provider_id: ProviderId,
    /// Provider method name.
    pub method: String,
    /// Provider-specific request arguments.
    pub args: Map<String, Value>,
}

/// How a trial submission was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialSubmission {
    /// Served instantly from the pool; the request is already fulfilled.
    CacheHit {
        /// The newly inserted, fulfilled request link.
        request: TrialRequest,
        /// The pooled creation the request points at.
        creation: TrialCreation,
    },
    /// The same (client, prompt) pair had already been submitted; no new
    /// work was started.
    Existing {
        /// The pre-existing request link.
        request: TrialRequest,
    },
    /// A fresh unpaid generation was inserted and enqueued.
    Submitted {
        /// The new, not yet fulfilled request link.
        request: TrialRequest,
        /// The new creation row in `Creating` status.
        creation: TrialCreation,
    },
}

/// Driving service for anonymous trials.
#[derive(Clone)]
pub struct TrialPoolService {
    ports: TrialPoolPorts,
    config: JobPipelineConfig,
    clock: Arc<dyn Clock>,
}

impl TrialPoolService {
    /// Create a new pool service over the given ports.
    pub fn new(ports: TrialPoolPorts, config: JobPipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ports,
            config,
            clock,
        }
    }

    /// Serve a trial from the pool when possible, otherwise reuse the
    /// client's existing submission or start a fresh unpaid job.
    pub async fn submit(&self, request: SubmitTrialRequest) -> Result<TrialSubmission, Error> {
        if request.prompt.trim().is_empty() {
            return Err(Error::invalid_request("prompt must not be empty"));
        }
        if request.method.trim().is_empty() {
            return Err(Error::invalid_request("method must not be empty"));
        }

        let now = self.clock.utc();
        let since = now - ttl_delta(&self.config);
        let pool = self
            .ports
            .trials
            .find_recent_completed_by_prompt(&request.prompt, since, self.config.trial_pool_size)
            .await
            .map_err(map_trial_repository_error)?;

        if !pool.is_empty() {
            let picked = pool[rand::thread_rng().gen_range(0..pool.len())].clone();
            let link = self
                .ports
                .trials
                .insert_request(NewTrialRequest {
                    client_id: request.client_id.clone(),
                    prompt: request.prompt.clone(),
                    trial_id: picked.id,
                    created_at: now,
                    fulfilled_at: Some(now),
                })
                .await
                .map_err(map_trial_repository_error)?;

            if pool.len() < self.config.trial_pool_size {
                self.refill_pool(&request.prompt, &picked).await;
            }
            return Ok(TrialSubmission::CacheHit {
                request: link,
                creation: picked,
            });
        }

        if let Some(existing) = self
            .ports
            .trials
            .find_request_by_client_and_prompt(&request.client_id, &request.prompt)
            .await
            .map_err(map_trial_repository_error)?
        {
            // Discarded links (no creation reference) do not satisfy a
            // resubmission.
            if existing.trial_id.is_some() {
                return Ok(TrialSubmission::Existing { request: existing });
            }
        }

        // The prompt is both the pool cache key and the generation subject;
        // threading it into the provider args keeps the stored image true to
        // the key it will be pooled under.
        let mut args = request.args;
        args.insert("prompt".to_owned(), Value::String(request.prompt.clone()));
        let metadata = self.pending_metadata(request.provider_id, &request.method, args);
        let creation = self
            .ports
            .trials
            .insert_creation(NewTrialCreation {
                client_id: request.client_id.clone(),
                prompt: request.prompt.clone(),
                filename: placeholder_filename(metadata.submission_token),
                created_at: now,
                metadata,
            })
            .await
            .map_err(map_trial_repository_error)?;
        let link = self
            .ports
            .trials
            .insert_request(NewTrialRequest {
                client_id: request.client_id,
                prompt: request.prompt,
                trial_id: creation.id,
                created_at: now,
                fulfilled_at: None,
            })
            .await
            .map_err(map_trial_repository_error)?;

        self.ports
            .queue
            .enqueue(QueuedJob::Trial {
                trial_id: creation.id,
            })
            .await
            .map_err(map_dispatch_error)?;

        Ok(TrialSubmission::Submitted {
            request: link,
            creation,
        })
    }

    /// Execute one delivered trial generation. Gated on `Creating`, so
    /// duplicate deliveries are no-ops. On completion every linked request
    /// is stamped fulfilled.
    pub async fn execute(&self, trial_id: TrialId) -> Result<JobRunOutcome, Error> {
        let Some(creation) = self
            .ports
            .trials
            .find_creation_by_id(trial_id)
            .await
            .map_err(map_trial_repository_error)?
        else {
            return Ok(JobRunOutcome::NotFound);
        };
        if !creation.is_creating() {
            return Ok(JobRunOutcome::AlreadyHandled);
        }

        let provider = match self.lookup_provider(creation.metadata.provider_id).await? {
            Ok(provider) => provider,
            Err(failure) => return self.reconcile_failure(&creation, failure).await,
        };

        let attempt = run_generation(
            GenerationDeps {
                gateway: self.ports.gateway.as_ref(),
                normalizer: self.ports.normalizer.as_ref(),
                storage: self.ports.storage.as_ref(),
            },
            &provider,
            &creation.metadata.method,
            &creation.metadata.args,
            self.config.provider_timeout,
            artifact_filename("trials"),
        )
        .await;

        match attempt {
            Ok(artifact) => {
                let now = self.clock.utc();
                let metadata = creation.metadata.clone().into_completed(
                    now,
                    artifact.attributes.width,
                    artifact.attributes.height,
                    artifact.attributes.color.clone(),
                );
                let applied = self
                    .ports
                    .trials
                    .mark_creation_completed(
                        creation.id,
                        CompletionUpdate {
                            filename: artifact.filename,
                            url: artifact.url,
                            metadata,
                        },
                    )
                    .await
                    .map_err(map_trial_repository_error)?;
                // A lost transition means a concurrent delivery settled the
                // row; its winner stamps the linked requests.
                if !applied {
                    return Ok(JobRunOutcome::AlreadyHandled);
                }
                self.ports
                    .trials
                    .fulfil_requests_for_creation(creation.id, now)
                    .await
                    .map_err(map_trial_repository_error)?;
                Ok(JobRunOutcome::Completed)
            }
            Err(failure) => self.reconcile_failure(&creation, failure).await,
        }
    }

    /// Unlink the caller's own request and delete the stored file once no
    /// other request references it. Discarding twice is a no-op.
    pub async fn discard(
        &self,
        client_id: &ClientId,
        request_id: TrialRequestId,
    ) -> Result<(), Error> {
        let request = self
            .ports
            .trials
            .find_request_by_id(request_id)
            .await
            .map_err(map_trial_repository_error)?
            .ok_or_else(|| Error::not_found(format!("trial request {request_id} not found")))?;
        if &request.client_id != client_id {
            return Err(Error::forbidden(
                "trial request does not belong to the caller",
            ));
        }
        let Some(trial_id) = request.trial_id else {
            return Ok(());
        };

        let creation = self
            .ports
            .trials
            .find_creation_by_id(trial_id)
            .await
            .map_err(map_trial_repository_error)?;

        self.ports
            .trials
            .unlink_request(request_id)
            .await
            .map_err(map_trial_repository_error)?;

        // Shared files are reference counted across requests; only the last
        // discard removes the blob. Placeholder filenames were never
        // uploaded.
        let Some(creation) = creation else {
            return Ok(());
        };
        if creation.status != CreationStatus::Completed {
            return Ok(());
        }
        let remaining = self
            .ports
            .trials
            .count_requests_by_filename(&creation.filename)
            .await
            .map_err(map_trial_repository_error)?;
        if remaining == 0 {
            if let Err(error) = self.ports.storage.delete(&creation.filename).await {
                tracing::warn!(
                    trial_id = %creation.id,
                    filename = %creation.filename,
                    %error,
                    "discarded trial file could not be deleted"
                );
            }
        }
        Ok(())
    }

    /// Insert and enqueue one pool-owned replacement row so the next hit
    /// finds a full pool. Failures only cost freshness, so they are logged
    /// and swallowed.
    async fn refill_pool(&self, prompt: &str, template: &TrialCreation) {
        let metadata = self.pending_metadata(
            template.metadata.provider_id,
            &template.metadata.method,
            template.metadata.args.clone(),
        );
        let draft = NewTrialCreation {
            client_id: ClientId::pool(),
            prompt: prompt.to_owned(),
            filename: placeholder_filename(metadata.submission_token),
            created_at: self.clock.utc(),
            metadata,
        };
        let creation = match self.ports.trials.insert_creation(draft).await {
            Ok(creation) => creation,
            Err(error) => {
                tracing::warn!(prompt, %error, "trial pool refill insert failed");
                return;
            }
        };
        if let Err(error) = self
            .ports
            .queue
            .enqueue(QueuedJob::Trial {
                trial_id: creation.id,
            })
            .await
        {
            tracing::warn!(prompt, trial_id = %creation.id, %error, "trial pool refill enqueue failed");
        }
    }

    async fn reconcile_failure(
        &self,
        creation: &TrialCreation,
        failure: JobFailure,
    ) -> Result<JobRunOutcome, Error> {
        let kind = failure.kind;
        let metadata = creation
            .metadata
            .clone()
            .into_failed(failure, self.clock.utc());
        let applied = self
            .ports
            .trials
            .mark_creation_failed(creation.id, metadata)
            .await
            .map_err(map_trial_repository_error)?;
        if !applied {
            return Ok(JobRunOutcome::AlreadyHandled);
        }
        Ok(JobRunOutcome::Failed(kind))
    }

    async fn lookup_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Result<Provider, JobFailure>, Error> {
        let provider = self
            .ports
            .providers
            .find_by_id(provider_id)
            .await
            .map_err(map_provider_repository_error)?;
        Ok(match provider {
            Some(provider) if provider.is_active() => Ok(provider),
            Some(_) => Err(JobFailure::invalid_provider(format!(
                "provider {provider_id} is not active"
            ))),
            None => Err(JobFailure::invalid_provider(format!(
                "provider {provider_id} not found"
            ))),
        })
    }

    fn pending_metadata(
        &self,
        provider_id: ProviderId,
        method: &str,
        args: Map<String, Value>,
    ) -> CreationMetadata {
        let now = self.clock.utc();
        let budget = self.config.provider_timeout + self.config.timeout_safety_margin;
        let deadline =
            now + TimeDelta::milliseconds(i64::try_from(budget.as_millis()).unwrap_or(i64::MAX));
        CreationMetadata::pending(provider_id, method, args, None, now, deadline)
    }
}

fn ttl_delta(config: &JobPipelineConfig) -> TimeDelta {
    TimeDelta::milliseconds(i64::try_from(config.trial_pool_ttl.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "trial_pool_tests.rs"]
mod tests;
