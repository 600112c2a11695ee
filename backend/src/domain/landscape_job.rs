//! Secondary landscape generation for completed creations.
//!
//! A landscape is a widescreen companion render tracked inside the owning
//! creation's metadata rather than as a row of its own. The sub-state machine
//! (`NotRequested -> Loading -> Ready | Failed`) mirrors the primary runner:
//! debit before the durable `Loading` write, idempotent execution gated on
//! that state, exactly-once refunds on failure, and a best-effort delete of
//! the superseded file once a regeneration is durable.

use std::sync::Arc;

use mockable::Clock;
use serde_json::{Map, Value};

use crate::config::JobPipelineConfig;

use super::creation::{Creation, CreationStatus, JobFailure, LandscapeState};
use super::creation_job::{
    CreationJobPorts, JobRunOutcome, Requester, map_creation_repository_error, map_dispatch_error,
    map_ledger_error, map_provider_repository_error,
};
use super::error::Error;
use super::generation::{GenerationDeps, artifact_filename, run_generation};
use super::identity::{CreationId, ProviderId, UserId};
use super::ports::{Provider, QueuedJob};

/// Submission request for a landscape render of an existing creation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitLandscapeRequest {
    /// Identity submitting the job.
    pub requester: Requester,
    /// Completed creation to render a landscape for.
    pub creation_id: CreationId,
    /// Target provider.
    pub provider_id: ProviderId,
    /// Provider method name.
    pub method: String,
    /// Provider-specific request arguments.
    pub args: Map<String, Value>,
    /// Credits to charge; zero submits an unpaid render.
    pub credit_cost: i64,
}

/// Driving service for landscape jobs. Shares the creation runner's ports.
#[derive(Clone)]
pub struct LandscapeJobService {
    ports: CreationJobPorts,
    config: JobPipelineConfig,
    clock: Arc<dyn Clock>,
}

impl LandscapeJobService {
    /// Create a new runner over the given ports.
    pub fn new(ports: CreationJobPorts, config: JobPipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ports,
            config,
            clock,
        }
    }

    /// Debit the cost, write the `Loading` sub-state into the creation's
    /// metadata, and enqueue the render. One landscape at a time per
    /// creation.
    pub async fn submit(&self, request: SubmitLandscapeRequest) -> Result<Creation, Error> {
        if request.credit_cost < 0 {
            return Err(Error::invalid_request("credit cost must not be negative"));
        }
        if request.method.trim().is_empty() {
            return Err(Error::invalid_request("method must not be empty"));
        }

        let creation = self.require_owned(request.creation_id, &request.requester).await?;
        if creation.status != CreationStatus::Completed {
            return Err(Error::conflict(
                "landscapes require a completed creation",
            ));
        }
        if creation.metadata.landscape.is_loading() {
            return Err(Error::conflict("a landscape render is already in flight"));
        }

        let provider = self.require_active_provider(request.provider_id).await?;
        let mut args = request.args.clone();
        self.attach_source_image(&creation, &mut args).await;

        let owner = creation.owner.clone();
        let cost = request.credit_cost;
        self.debit_for(&owner, cost).await?;

        let previous_filename = match &creation.metadata.landscape {
            LandscapeState::Ready { filename, .. } => Some(filename.clone()),
            _ => None,
        };
        let mut metadata = creation.metadata.clone();
        metadata.landscape = LandscapeState::Loading {
            provider_id: provider.id,
            method: request.method,
            args,
            credit_cost: cost,
            started_at: self.clock.utc(),
            previous_filename,
        };

        if let Err(err) = self
            .ports
            .creations
            .update_metadata(creation.id, metadata.clone())
            .await
        {
            self.compensate_debit(&owner, cost).await?;
            return Err(map_creation_repository_error(err));
        }

        self.ports
            .queue
            .enqueue(QueuedJob::Landscape {
                creation_id: creation.id,
            })
            .await
            .map_err(map_dispatch_error)?;

        let mut updated = creation;
        updated.metadata = metadata;
        Ok(updated)
    }

    /// Execute one delivered landscape render. Gated on the `Loading`
    /// sub-state, so duplicate deliveries are no-ops.
    pub async fn execute(&self, creation_id: CreationId) -> Result<JobRunOutcome, Error> {
        let Some(creation) = self
            .ports
            .creations
            .find_by_id(creation_id)
            .await
            .map_err(map_creation_repository_error)?
        else {
            return Ok(JobRunOutcome::NotFound);
        };
        let LandscapeState::Loading {
            provider_id,
            method,
            args,
            credit_cost,
            previous_filename,
            ..
        } = creation.metadata.landscape.clone()
        else {
            return Ok(JobRunOutcome::AlreadyHandled);
        };

        let provider = match self.lookup_provider(provider_id).await? {
            Ok(provider) => provider,
            Err(failure) => {
                return self
                    .reconcile_failure(&creation, failure, credit_cost)
                    .await;
            }
        };

        let attempt = run_generation(
            GenerationDeps {
                gateway: self.ports.gateway.as_ref(),
                normalizer: self.ports.normalizer.as_ref(),
                storage: self.ports.storage.as_ref(),
            },
            &provider,
            &method,
            &args,
            self.config.provider_timeout,
            artifact_filename("landscapes"),
        )
        .await;

        match attempt {
            Ok(artifact) => {
                let applied = self
                    .ports
                    .creations
                    .settle_landscape(
                        creation.id,
                        LandscapeState::Ready {
                            url: artifact.url,
                            filename: artifact.filename,
                        },
                    )
                    .await
                    .map_err(map_creation_repository_error)?;
                // A lost write means a concurrent delivery settled this
                // attempt; its winner owns the superseded-file delete.
                if !applied {
                    return Ok(JobRunOutcome::AlreadyHandled);
                }

                // The replaced file is removed only once the new landscape is
                // durable; a failed delete leaves an orphan, never a broken
                // creation.
                if let Some(previous) = previous_filename {
                    if let Err(error) = self.ports.storage.delete(&previous).await {
                        tracing::warn!(
                            creation_id = %creation.id,
                            filename = %previous,
                            %error,
                            "superseded landscape file could not be deleted"
                        );
                    }
                }
                Ok(JobRunOutcome::Completed)
            }
            Err(failure) => {
                self.reconcile_failure(&creation, failure, credit_cost)
                    .await
            }
        }
    }

    async fn reconcile_failure(
        &self,
        creation: &Creation,
        failure: JobFailure,
        credit_cost: i64,
    ) -> Result<JobRunOutcome, Error> {
        let kind = failure.kind;
        let applied = self
            .ports
            .creations
            .settle_landscape(
                creation.id,
                LandscapeState::Failed {
                    message: failure.message,
                    credits_refunded: false,
                },
            )
            .await
            .map_err(map_creation_repository_error)?;
        if !applied {
            return Ok(JobRunOutcome::AlreadyHandled);
        }

        // The refund flag is claimed before the ledger credit; at most one
        // caller credits a failed attempt.
        if credit_cost > 0 {
            let claimed = self
                .ports
                .creations
                .claim_landscape_refund(creation.id)
                .await
                .map_err(map_creation_repository_error)?;
            if claimed {
                self.ports
                    .ledger
                    .adjust(&creation.owner, credit_cost)
                    .await
                    .map_err(map_ledger_error)?;
            }
        }

        Ok(JobRunOutcome::Failed(kind))
    }

    async fn attach_source_image(&self, creation: &Creation, args: &mut Map<String, Value>) {
        let Some(url) = creation.url.as_deref() else {
            return;
        };
        let reference = if creation.published {
            url.to_owned()
        } else {
            match self.ports.tokens.mint(creation.id).await {
                Ok(token) => format!("{url}?token={token}"),
                Err(error) => {
                    tracing::warn!(
                        creation_id = %creation.id,
                        %error,
                        "access token mint failed; keeping the unscoped source reference"
                    );
                    url.to_owned()
                }
            }
        };
        args.insert("image".to_owned(), Value::String(reference));
    }

    async fn debit_for(&self, owner: &UserId, cost: i64) -> Result<(), Error> {
        if cost <= 0 {
            return Ok(());
        }
        let balance = self
            .ports
            .ledger
            .balance(owner)
            .await
            .map_err(map_ledger_error)?;
        if balance < cost {
            return Err(Error::insufficient_credits(format!(
                "balance {balance} cannot cover cost {cost}"
            )));
        }
        self.ports
            .ledger
            .adjust(owner, -cost)
            .await
            .map_err(map_ledger_error)?;
        Ok(())
    }

    async fn compensate_debit(
        &self,
        owner: &UserId,
        cost: i64,
    ) -> Result<(), Error> {
        if cost <= 0 {
            return Ok(());
        }
        if let Err(error) = self.ports.ledger.adjust(owner, cost).await {
            tracing::error!(%owner, cost, %error, "debit compensation failed");
            return Err(Error::internal(format!(
                "landscape submit failed and the debit could not be compensated: {error}"
            )));
        }
        Ok(())
    }

    async fn require_owned(
        &self,
        creation_id: CreationId,
        requester: &Requester,
    ) -> Result<Creation, Error> {
        let creation = self
            .ports
            .creations
            .find_by_id(creation_id)
            .await
            .map_err(map_creation_repository_error)?
            .ok_or_else(|| Error::not_found(format!("creation {creation_id} not found")))?;
        if creation.owner != requester.user_id && !requester.privileged {
            return Err(Error::forbidden(
                "creation does not belong to the requester",
            ));
        }
        Ok(creation)
    }

    async fn require_active_provider(&self, provider_id: ProviderId) -> Result<Provider, Error> {
        let provider = self
            .ports
            .providers
            .find_by_id(provider_id)
            .await
            .map_err(map_provider_repository_error)?
            .ok_or_else(|| Error::not_found(format!("provider {provider_id} not found")))?;
        if !provider.is_active() {
            return Err(Error::invalid_request(format!(
                "provider {provider_id} is not active"
            )));
        }
        Ok(provider)
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
}

#[cfg(test)]
#[path = "landscape_job_tests.rs"]
mod tests;
