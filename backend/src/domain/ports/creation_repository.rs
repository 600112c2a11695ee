//! Port for authenticated creation persistence.
//!
//! The repository owns status transitions as whole-row updates; callers
//! compose the metadata they want durable and the adapter persists it
//! atomically with the status change.

use async_trait::async_trait;

use crate::domain::creation::{
    CompletionUpdate, Creation, CreationMetadata, LandscapeState, NewCreation,
};
use crate::domain::identity::CreationId;

/// Errors raised by creation repository adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreationRepositoryError {
    /// Repository connection could not be established.
    #[error("creation repository connection failed: {message}")]
    Connection { message: String },
    /// Query or mutation failed during execution.
    #[error("creation repository query failed: {message}")]
    Query { message: String },
}

impl CreationRepositoryError {
    /// Helper for connection oriented failures.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Helper for query failures.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }
}

/// Port for creation row persistence and status transitions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreationRepository: Send + Sync {
    /// Insert a new row in `Creating` status and return it with its id.
    async fn insert(&self, draft: NewCreation) -> Result<Creation, CreationRepositoryError>;

    /// Find a creation by its id.
    async fn find_by_id(
        &self,
        creation_id: CreationId,
    ) -> Result<Option<Creation>, CreationRepositoryError>;

    /// Transition a row to `Completed` with its final artifact fields.
    ///
    /// The transition is conditional: it applies only while the row is still
    /// `Creating`, and the return value reports whether this call applied it.
    /// Concurrent duplicate deliveries race here and exactly one wins.
    async fn mark_completed(
        &self,
        creation_id: CreationId,
        update: CompletionUpdate,
    ) -> Result<bool, CreationRepositoryError>;

    /// Transition a row to `Failed`, persisting the failed outcome metadata.
    /// Conditional on `Creating`, like [`Self::mark_completed`].
    async fn mark_failed(
        &self,
        creation_id: CreationId,
        metadata: CreationMetadata,
    ) -> Result<bool, CreationRepositoryError>;

    /// Atomically set the failed outcome's `credits_refunded` flag.
    ///
    /// Returns `true` only for the call that flipped the flag from unset;
    /// `false` when the row is not in a failed outcome or the flag was
    /// already set. The caller that wins the claim owns the ledger credit.
    async fn claim_refund(
        &self,
        creation_id: CreationId,
    ) -> Result<bool, CreationRepositoryError>;

    /// Reset a row back to `Creating` for an in-place retry, replacing its
    /// filename, cost, and metadata while keeping the same identity.
    async fn reset_for_retry(
        &self,
        creation_id: CreationId,
        filename: String,
        credit_cost: i64,
        metadata: CreationMetadata,
    ) -> Result<(), CreationRepositoryError>;

    /// Replace a row's metadata without touching its status. Used for the
    /// `Loading` landscape write at submission.
    async fn update_metadata(
        &self,
        creation_id: CreationId,
        metadata: CreationMetadata,
    ) -> Result<(), CreationRepositoryError>;

    /// Replace the landscape sub-state, succeeding only while the current
    /// sub-state is `Loading`. Returns whether this call applied the write.
    async fn settle_landscape(
        &self,
        creation_id: CreationId,
        state: LandscapeState,
    ) -> Result<bool, CreationRepositoryError>;

    /// Atomically set the `credits_refunded` flag of a failed landscape.
    /// Same claim contract as [`Self::claim_refund`].
    async fn claim_landscape_refund(
        &self,
        creation_id: CreationId,
    ) -> Result<bool, CreationRepositoryError>;
}

/// Fixture implementation for tests that do not exercise persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureCreationRepository;

#[async_trait]
impl CreationRepository for FixtureCreationRepository {
    async fn insert(&self, draft: NewCreation) -> Result<Creation, CreationRepositoryError> {
        Ok(Creation {
            id: CreationId::new(1),
            owner: draft.owner,
            status: crate::domain::creation::CreationStatus::Creating,
            credit_cost: draft.credit_cost,
            published: false,
            filename: draft.filename,
            url: None,
            metadata: draft.metadata,
        })
    }

    async fn find_by_id(
        &self,
        _creation_id: CreationId,
    ) -> Result<Option<Creation>, CreationRepositoryError> {
        Ok(None)
    }

    async fn mark_completed(
        &self,
        _creation_id: CreationId,
        _update: CompletionUpdate,
    ) -> Result<bool, CreationRepositoryError> {
        Ok(true)
    }

    async fn mark_failed(
        &self,
        _creation_id: CreationId,
        _metadata: CreationMetadata,
    ) -> Result<bool, CreationRepositoryError> {
        Ok(true)
    }

    async fn claim_refund(
        &self,
        _creation_id: CreationId,
    ) -> Result<bool, CreationRepositoryError> {
        Ok(true)
    }

    async fn reset_for_retry(
        &self,
        _creation_id: CreationId,
        _filename: String,
        _credit_cost: i64,
        _metadata: CreationMetadata,
    ) -> Result<(), CreationRepositoryError> {
        Ok(())
    }

    async fn update_metadata(
        &self,
        _creation_id: CreationId,
        _metadata: CreationMetadata,
    ) -> Result<(), CreationRepositoryError> {
        Ok(())
    }

    async fn settle_landscape(
        &self,
        _creation_id: CreationId,
        _state: LandscapeState,
    ) -> Result<bool, CreationRepositoryError> {
        Ok(true)
    }

    async fn claim_landscape_refund(
        &self,
        _creation_id: CreationId,
    ) -> Result<bool, CreationRepositoryError> {
        Ok(true)
    }
}
