//! Authenticated creation job runner.
//!
//! Owns the submission/execution state machine for paid creations: debit on
//! submit, durable `Creating` row before any provider call, reconciliation of
//! the provider outcome into terminal state, exactly-once compensating
//! refunds, in-place retry, and abandonment of stuck rows. Ordinary provider
//! and storage failures are reconciled into the row, never propagated; only
//! infrastructure errors (repository, ledger) escape as [`Error`].

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;
use serde_json::{Map, Value};

use crate::config::JobPipelineConfig;

use super::creation::{
    CompletionUpdate, Creation, CreationMetadata, CreationStatus, JobFailure, JobFailureKind,
    Lineage, NewCreation, placeholder_filename,
};
use super::error::Error;
use super::generation::{GenerationDeps, GeneratedArtifact, artifact_filename, run_generation};
use super::identity::{CreationId, ProviderId, UserId};
use super::ports::{
    AccessTokenMinter, CreationRepository, CreationRepositoryError, CreditLedger,
    CreditLedgerError, ImageNormalizer, JobDispatchError, JobQueue, Provider, ProviderGateway,
    ProviderRepository, ProviderRepositoryError, QueuedJob, StorageSink,
};

pub(crate) fn map_creation_repository_error(error: CreationRepositoryError) -> Error {
    match error {
        CreationRepositoryError::Connection { message } => {
            Error::service_unavailable(format!("creation repository unavailable: {message}"))
        }
        CreationRepositoryError::Query { message } => {
            Error::internal(format!("creation repository error: {message}"))
        }
    }
}

pub(crate) fn map_ledger_error(error: CreditLedgerError) -> Error {
    match error {
        CreditLedgerError::Connection { message } => {
            Error::service_unavailable(format!("credit ledger unavailable: {message}"))
        }
        CreditLedgerError::Operation { message } => {
            Error::internal(format!("credit ledger error: {message}"))
        }
    }
}

pub(crate) fn map_provider_repository_error(error: ProviderRepositoryError) -> Error {
    match error {
        ProviderRepositoryError::Connection { message } => {
            Error::service_unavailable(format!("provider repository unavailable: {message}"))
        }
        ProviderRepositoryError::Query { message } => {
            Error::internal(format!("provider repository error: {message}"))
        }
    }
}

pub(crate) fn map_dispatch_error(error: JobDispatchError) -> Error {
    Error::service_unavailable(format!("job dispatch failed: {error}"))
}

/// Port bundle required by the creation job runner.
#[derive(Clone)]
pub struct CreationJobPorts {
    /// Provider lookup.
    pub providers: Arc<dyn ProviderRepository>,
    /// Creation row persistence.
    pub creations: Arc<dyn CreationRepository>,
    /// Per-user credit balances.
    pub ledger: Arc<dyn CreditLedger>,
    /// Outbound generation call.
    pub gateway: Arc<dyn ProviderGateway>,
    /// Canonical format conversion.
    pub normalizer: Arc<dyn ImageNormalizer>,
    /// Artifact blob storage.
    pub storage: Arc<dyn StorageSink>,
    /// Asynchronous job dispatch.
    pub queue: Arc<dyn JobQueue>,
    /// Scoped access tokens for protected mutation sources.
    pub tokens: Arc<dyn AccessTokenMinter>,
}

/// Identity on whose behalf a driving operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// Authenticated user.
    pub user_id: UserId,
    /// Whether the requester may act on creations it does not own.
    pub privileged: bool,
}

impl Requester {
    /// A plain, unprivileged requester.
    pub const fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            privileged: false,
        }
    }
}

/// Submission request for one authenticated creation job.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitCreationRequest {
    /// Identity submitting the job.
    pub requester: Requester,
    /// Target provider.
    pub provider_id: ProviderId,
    /// Provider method name.
    pub method: String,
    /// Provider-specific request arguments.
    pub args: Map<String, Value>,
    /// Credits to charge; zero submits an unpaid job.
    pub credit_cost: i64,
    /// Source creation when this submission is a mutation.
    pub mutate_of_id: Option<CreationId>,
}

/// Outcome of one `execute` delivery.
///
/// `AlreadyHandled` and `NotFound` are idempotency short-circuits, not
/// errors: duplicate deliveries land there and must trigger no writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunOutcome {
    /// The row transitioned to `Completed`.
    Completed,
    /// The row transitioned to `Failed` with this kind.
    Failed(JobFailureKind),
    /// The row had already left `Creating`; nothing was written.
    AlreadyHandled,
    /// The row no longer exists; nothing was written.
    NotFound,
}

/// Driving service for authenticated creation jobs.
#[derive(Clone)]
pub struct CreationJobService {
    ports: CreationJobPorts,
    config: JobPipelineConfig,
    clock: Arc<dyn Clock>,
}

impl CreationJobService {
    /// Create a new runner over the given ports.
    pub fn new(ports: CreationJobPorts, config: JobPipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ports,
            config,
            clock,
        }
    }

    /// Validate preconditions, debit the cost, record the durable `Creating`
    /// row, and hand the job to the scheduler. Returns without waiting for
    /// the provider.
    pub async fn submit(&self, request: SubmitCreationRequest) -> Result<Creation, Error> {
        if request.credit_cost < 0 {
            return Err(Error::invalid_request("credit cost must not be negative"));
        }
        if request.method.trim().is_empty() {
            return Err(Error::invalid_request("method must not be empty"));
        }

        let provider = self.require_active_provider(request.provider_id).await?;
        let mut args = request.args.clone();
        let lineage = self.resolve_lineage(&request, &mut args).await?;

        let user_id = request.requester.user_id.clone();
        let cost = request.credit_cost;
        self.debit(&user_id, cost).await?;

        let now = self.clock.utc();
        let metadata = CreationMetadata::pending(
            provider.id,
            request.method,
            args,
            lineage,
            now,
            self.submission_deadline(now),
        );
        let filename = placeholder_filename(metadata.submission_token);
        let draft = NewCreation {
            owner: user_id.clone(),
            credit_cost: cost,
            filename,
            metadata,
        };

        // The debit precedes the insert, so an insert failure must compensate
        // the ledger before the error propagates. No silent credit loss.
        let creation = match self.ports.creations.insert(draft).await {
            Ok(creation) => creation,
            Err(err) => {
                self.compensate_debit(&user_id, cost, "creation insert").await?;
                return Err(map_creation_repository_error(err));
            }
        };

        self.ports
            .queue
            .enqueue(QueuedJob::Creation {
                creation_id: creation.id,
            })
            .await
            .map_err(map_dispatch_error)?;

        Ok(creation)
    }

    /// Execute one delivered job. Safe under at-least-once delivery: the
    /// first step re-reads the row and exits when it already left
    /// `Creating`.
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
        if !creation.is_creating() {
            return Ok(JobRunOutcome::AlreadyHandled);
        }

        let provider = match self.lookup_provider(creation.metadata.provider_id).await? {
            Ok(provider) => provider,
            Err(failure) => return self.reconcile_failure(&creation, failure).await,
        };

        let attempt = run_generation(
            self.generation_deps(),
            &provider,
            &creation.metadata.method,
            &creation.metadata.args,
            self.config.provider_timeout,
            artifact_filename("creations"),
        )
        .await;

        match attempt {
            Ok(artifact) => self.reconcile_success(&creation, &provider, artifact).await,
            Err(failure) => self.reconcile_failure(&creation, failure).await,
        }
    }

    /// Retry a failed (or abandoned in-flight) creation on the same row.
    ///
    /// Refunds the prior paid attempt when still unrefunded, debits the new
    /// attempt, resets the row to `Creating` with lineage preserved, and
    /// re-enqueues it. Completed rows are never retried.
    pub async fn retry_in_place(
        &self,
        creation_id: CreationId,
        requester: &Requester,
    ) -> Result<Creation, Error> {
        let creation = self.require_visible(creation_id, requester).await?;
        let now = self.clock.utc();

        match creation.status {
            CreationStatus::Completed => {
                return Err(Error::conflict("completed creations cannot be retried"));
            }
            CreationStatus::Creating if !creation.metadata.is_past_timeout(now) => {
                return Err(Error::conflict("creation is still in flight"));
            }
            // A stuck in-flight row is reconciled to a timeout failure first,
            // so the refund guard stays the single source of compensation.
            CreationStatus::Creating => {
                self.fail_as_timeout(&creation).await?;
            }
            CreationStatus::Failed => {
                self.refund_once(&creation).await?;
            }
        }

        let prior = self
            .ports
            .creations
            .find_by_id(creation_id)
            .await
            .map_err(map_creation_repository_error)?
            .ok_or_else(|| Error::not_found(format!("creation {creation_id} not found")))?;
        // A concurrent delivery may have reconciled the stuck row to
        // `Completed` while we raced it; never clobber a completed row.
        if prior.status == CreationStatus::Completed {
            return Err(Error::conflict("completed creations cannot be retried"));
        }

        let cost = prior.credit_cost;
        self.debit(&prior.owner, cost).await?;

        let now = self.clock.utc();
        let metadata = CreationMetadata::pending(
            prior.metadata.provider_id,
            prior.metadata.method.clone(),
            prior.metadata.args.clone(),
            prior.metadata.lineage.clone(),
            now,
            self.submission_deadline(now),
        );
        let filename = placeholder_filename(metadata.submission_token);

        if let Err(err) = self
            .ports
            .creations
            .reset_for_retry(prior.id, filename, cost, metadata)
            .await
        {
            self.compensate_debit(&prior.owner, cost, "retry reset").await?;
            return Err(map_creation_repository_error(err));
        }

        self.ports
            .queue
            .enqueue(QueuedJob::Creation {
                creation_id: prior.id,
            })
            .await
            .map_err(map_dispatch_error)?;

        self.ports
            .creations
            .find_by_id(creation_id)
            .await
            .map_err(map_creation_repository_error)?
            .ok_or_else(|| Error::not_found(format!("creation {creation_id} not found")))
    }

    /// Give up waiting on a stuck in-flight row: transition it to a timeout
    /// failure and refund once. Does not resubmit.
    pub async fn mark_abandoned_as_failed(
        &self,
        creation_id: CreationId,
        requester: &Requester,
    ) -> Result<JobRunOutcome, Error> {
        let creation = self.require_visible(creation_id, requester).await?;
        if !creation.is_creating() {
            return Ok(JobRunOutcome::AlreadyHandled);
        }
        if !creation.metadata.is_past_timeout(self.clock.utc()) {
            return Err(Error::conflict("creation has not yet passed its timeout"));
        }

        if !self.fail_as_timeout(&creation).await? {
            return Ok(JobRunOutcome::AlreadyHandled);
        }
        Ok(JobRunOutcome::Failed(JobFailureKind::Timeout))
    }

    async fn reconcile_success(
        &self,
        creation: &Creation,
        provider: &Provider,
        artifact: GeneratedArtifact,
    ) -> Result<JobRunOutcome, Error> {
        let now = self.clock.utc();
        let metadata = creation.metadata.clone().into_completed(
            now,
            artifact.attributes.width,
            artifact.attributes.height,
            artifact.attributes.color.clone(),
        );
        let applied = self
            .ports
            .creations
            .mark_completed(
                creation.id,
                CompletionUpdate {
                    filename: artifact.filename,
                    url: artifact.url,
                    metadata,
                },
            )
            .await
            .map_err(map_creation_repository_error)?;
        // A lost transition means a concurrent delivery already settled the
        // row; its winner owns the side effects.
        if !applied {
            return Ok(JobRunOutcome::AlreadyHandled);
        }

        self.share_provider_revenue(creation, provider).await;
        Ok(JobRunOutcome::Completed)
    }

    async fn reconcile_failure(
        &self,
        creation: &Creation,
        failure: JobFailure,
    ) -> Result<JobRunOutcome, Error> {
        let kind = failure.kind;
        let metadata = creation
            .metadata
            .clone()
            .into_failed(failure, self.clock.utc());
        let applied = self
            .ports
            .creations
            .mark_failed(creation.id, metadata)
            .await
            .map_err(map_creation_repository_error)?;
        if !applied {
            return Ok(JobRunOutcome::AlreadyHandled);
        }
        self.refund_once(creation).await?;
        Ok(JobRunOutcome::Failed(kind))
    }

    /// Refund the attempt's cost at most once.
    ///
    /// The durable flag is claimed before the ledger credit, so concurrent
    /// callers cannot both refund. A crash between the claim and the credit
    /// leaves the row refund-flagged without the credit; the flag is the
    /// authority, and the invariant held is at most one refund per attempt.
    async fn refund_once(&self, creation: &Creation) -> Result<(), Error> {
        if creation.credit_cost <= 0 {
            return Ok(());
        }
        let claimed = self
            .ports
            .creations
            .claim_refund(creation.id)
            .await
            .map_err(map_creation_repository_error)?;
        if !claimed {
            return Ok(());
        }
        self.ports
            .ledger
            .adjust(&creation.owner, creation.credit_cost)
            .await
            .map_err(map_ledger_error)?;
        Ok(())
    }

    /// Reconcile a stuck row to a timeout failure. Returns whether this call
    /// applied the transition; a lost race leaves the refund to the winner.
    async fn fail_as_timeout(&self, creation: &Creation) -> Result<bool, Error> {
        let metadata = creation.metadata.clone().into_failed(
            JobFailure::timeout("abandoned after the submission deadline"),
            self.clock.utc(),
        );
        let applied = self
            .ports
            .creations
            .mark_failed(creation.id, metadata)
            .await
            .map_err(map_creation_repository_error)?;
        if applied {
            self.refund_once(creation).await?;
        }
        Ok(applied)
    }

    async fn share_provider_revenue(&self, creation: &Creation, provider: &Provider) {
        let share = self.config.revenue_share_for(creation.credit_cost);
        if share <= 0 {
            return;
        }
        // Best effort: a failed share credit never flips a completed job.
        if let Err(error) = self
            .ports
            .ledger
            .adjust(&provider.owner_user_id, share)
            .await
        {
            tracing::warn!(
                provider_id = %provider.id,
                creation_id = %creation.id,
                %error,
                "provider revenue share credit failed"
            );
        }
    }

    async fn debit(&self, user_id: &UserId, cost: i64) -> Result<(), Error> {
        if cost <= 0 {
            return Ok(());
        }
        let balance = self
            .ports
            .ledger
            .balance(user_id)
            .await
            .map_err(map_ledger_error)?;
        if balance < cost {
            return Err(Error::insufficient_credits(format!(
                "balance {balance} cannot cover cost {cost}"
            )));
        }
        self.ports
            .ledger
            .adjust(user_id, -cost)
            .await
            .map_err(map_ledger_error)?;
        Ok(())
    }

    async fn compensate_debit(
        &self,
        user_id: &UserId,
        cost: i64,
        context: &str,
    ) -> Result<(), Error> {
        if cost <= 0 {
            return Ok(());
        }
        if let Err(error) = self.ports.ledger.adjust(user_id, cost).await {
            tracing::error!(%user_id, cost, %error, context, "debit compensation failed");
            return Err(Error::internal(format!(
                "{context} failed and the debit could not be compensated: {error}"
            )));
        }
        Ok(())
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

    /// Provider validation on the execute path: a missing or inactive
    /// provider becomes a terminal `invalid_provider` failure, taken before
    /// any network call.
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

    async fn resolve_lineage(
        &self,
        request: &SubmitCreationRequest,
        args: &mut Map<String, Value>,
    ) -> Result<Option<Lineage>, Error> {
        let Some(source_id) = request.mutate_of_id else {
            return Ok(None);
        };
        let source = self
            .ports
            .creations
            .find_by_id(source_id)
            .await
            .map_err(map_creation_repository_error)?
            .ok_or_else(|| Error::not_found(format!("creation {source_id} not found")))?;

        let requester = &request.requester;
        let visible =
            source.owner == requester.user_id || source.published || requester.privileged;
        if !visible {
            return Err(Error::forbidden(
                "mutation source is not visible to the requester",
            ));
        }

        let mut history = source
            .metadata
            .lineage
            .as_ref()
            .map(|lineage| lineage.history.clone())
            .unwrap_or_default();
        history.push(source.id);

        if let Some(url) = source.url.as_deref() {
            let reference = self.source_image_reference(&source, url).await;
            args.insert("image".to_owned(), Value::String(reference));
        }

        Ok(Some(Lineage {
            mutate_of_id: source.id,
            history,
        }))
    }

    async fn source_image_reference(&self, source: &Creation, url: &str) -> String {
        if source.published {
            return url.to_owned();
        }
        match self.ports.tokens.mint(source.id).await {
            Ok(token) => format!("{url}?token={token}"),
            Err(error) => {
                // Non-fatal: the provider may still reject the fetch.
                tracing::warn!(
                    creation_id = %source.id,
                    %error,
                    "access token mint failed; keeping the unscoped source reference"
                );
                url.to_owned()
            }
        }
    }

    async fn require_visible(
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

    fn generation_deps(&self) -> GenerationDeps<'_> {
        GenerationDeps {
            gateway: self.ports.gateway.as_ref(),
            normalizer: self.ports.normalizer.as_ref(),
            storage: self.ports.storage.as_ref(),
        }
    }

    fn submission_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let budget = self.config.provider_timeout + self.config.timeout_safety_margin;
        now + TimeDelta::milliseconds(i64::try_from(budget.as_millis()).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
#[path = "creation_job_tests.rs"]
mod tests;
