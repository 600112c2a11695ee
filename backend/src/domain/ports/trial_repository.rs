//! Port for anonymous trial persistence.
//!
//! Covers both trial creation rows and the thin request links that let
//! several anonymous sessions share one completed result. Pool membership is
//! not a separate table: it is "recent completed rows for this prompt".

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::creation::{CompletionUpdate, CreationMetadata};
use crate::domain::identity::{ClientId, TrialId, TrialRequestId};
use crate::domain::trial::{NewTrialCreation, NewTrialRequest, TrialCreation, TrialRequest};

/// Errors raised by trial repository adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrialRepositoryError {
    /// Repository connection could not be established.
    #[error("trial repository connection failed: {message}")]
    Connection { message: String },
    /// Query or mutation failed during execution.
    #[error("trial repository query failed: {message}")]
    Query { message: String },
}

impl TrialRepositoryError {
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

/// Port for trial creation and request persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrialRepository: Send + Sync {
    /// Insert a new trial creation row in `Creating` status.
    async fn insert_creation(
        &self,
        draft: NewTrialCreation,
    ) -> Result<TrialCreation, TrialRepositoryError>;

    /// Find a trial creation by its id.
    async fn find_creation_by_id(
        &self,
        trial_id: TrialId,
    ) -> Result<Option<TrialCreation>, TrialRepositoryError>;

    /// Transition a trial creation to `Completed`.
    ///
    /// Conditional on the row still being `Creating`; the return value
    /// reports whether this call applied the transition, so concurrent
    /// duplicate deliveries produce exactly one terminal write.
    async fn mark_creation_completed(
        &self,
        trial_id: TrialId,
        update: CompletionUpdate,
    ) -> Result<bool, TrialRepositoryError>;

    /// Transition a trial creation to `Failed`. Conditional on `Creating`,
    /// like [`Self::mark_creation_completed`].
    async fn mark_creation_failed(
        &self,
        trial_id: TrialId,
        metadata: CreationMetadata,
    ) -> Result<bool, TrialRepositoryError>;

    /// Completed rows for the exact `prompt` created at or after `since`,
    /// newest first, capped at `limit`. This is the trial pool read.
    async fn find_recent_completed_by_prompt(
        &self,
        prompt: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrialCreation>, TrialRepositoryError>;

    /// Number of trial requests whose linked creation stores `filename`.
    /// Reference count consulted before deleting a shared file.
    async fn count_requests_by_filename(
        &self,
        filename: &str,
    ) -> Result<u64, TrialRepositoryError>;

    /// Insert a new trial request link.
    async fn insert_request(
        &self,
        draft: NewTrialRequest,
    ) -> Result<TrialRequest, TrialRepositoryError>;

    /// Find a request by its id.
    async fn find_request_by_id(
        &self,
        request_id: TrialRequestId,
    ) -> Result<Option<TrialRequest>, TrialRepositoryError>;

    /// Find the existing request for an exact (client, prompt) pair, newest
    /// first when several exist.
    async fn find_request_by_client_and_prompt(
        &self,
        client_id: &ClientId,
        prompt: &str,
    ) -> Result<Option<TrialRequest>, TrialRepositoryError>;

    /// Stamp `fulfilled_at` on every unfulfilled request linked to
    /// `trial_id`.
    async fn fulfil_requests_for_creation(
        &self,
        trial_id: TrialId,
        fulfilled_at: DateTime<Utc>,
    ) -> Result<(), TrialRepositoryError>;

    /// Clear a request's creation reference. The underlying row and file
    /// outlive the link until no other request references them.
    async fn unlink_request(
        &self,
        request_id: TrialRequestId,
    ) -> Result<(), TrialRepositoryError>;
}

/// Fixture implementation for tests that do not exercise trial persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureTrialRepository;

#[async_trait]
impl TrialRepository for FixtureTrialRepository {
    async fn insert_creation(
        &self,
        draft: NewTrialCreation,
    ) -> Result<TrialCreation, TrialRepositoryError> {
        Ok(TrialCreation {
            id: TrialId::new(1),
            client_id: draft.client_id,
            prompt: draft.prompt,
            status: crate::domain::creation::CreationStatus::Creating,
            filename: draft.filename,
            url: None,
            created_at: draft.created_at,
            metadata: draft.metadata,
        })
    }

    async fn find_creation_by_id(
        &self,
        _trial_id: TrialId,
    ) -> Result<Option<TrialCreation>, TrialRepositoryError> {
        Ok(None)
    }

    async fn mark_creation_completed(
        &self,
        _trial_id: TrialId,
        _update: CompletionUpdate,
    ) -> Result<bool, TrialRepositoryError> {
        Ok(true)
    }

    async fn mark_creation_failed(
        &self,
        _trial_id: TrialId,
        _metadata: CreationMetadata,
    ) -> Result<bool, TrialRepositoryError> {
        Ok(true)
    }

    async fn find_recent_completed_by_prompt(
        &self,
        _prompt: &str,
        _since: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<TrialCreation>, TrialRepositoryError> {
        Ok(Vec::new())
    }

    async fn count_requests_by_filename(
        &self,
        _filename: &str,
    ) -> Result<u64, TrialRepositoryError> {
        Ok(0)
    }

    async fn insert_request(
        &self,
        draft: NewTrialRequest,
    ) -> Result<TrialRequest, TrialRepositoryError> {
        Ok(TrialRequest {
            id: TrialRequestId::new(1),
            client_id: draft.client_id,
            prompt: draft.prompt,
            trial_id: Some(draft.trial_id),
            created_at: draft.created_at,
            fulfilled_at: draft.fulfilled_at,
        })
    }

    async fn find_request_by_id(
        &self,
        _request_id: TrialRequestId,
    ) -> Result<Option<TrialRequest>, TrialRepositoryError> {
        Ok(None)
    }

    async fn find_request_by_client_and_prompt(
        &self,
        _client_id: &ClientId,
        _prompt: &str,
    ) -> Result<Option<TrialRequest>, TrialRepositoryError> {
        Ok(None)
    }

    async fn fulfil_requests_for_creation(
        &self,
        _trial_id: TrialId,
        _fulfilled_at: DateTime<Utc>,
    ) -> Result<(), TrialRepositoryError> {
        Ok(())
    }

    async fn unlink_request(
        &self,
        _request_id: TrialRequestId,
    ) -> Result<(), TrialRepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn fixture_pool_read_is_empty() {
        let repo = FixtureTrialRepository;
        let pool = repo
            .find_recent_completed_by_prompt("sunset", Utc::now(), 5)
            .await
            .expect("fixture read succeeds");
        assert!(pool.is_empty());
    }

    #[rstest]
    fn query_error_formats_message() {
        let err = TrialRepositoryError::query("missing index");
        assert!(err.to_string().contains("missing index"));
    }
}
