//! Port for reading external generation providers.
//!
//! Providers are read-only from the pipeline's perspective; registration and
//! moderation happen elsewhere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::identity::{ProviderId, UserId};

/// Activation state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Accepting generation requests.
    Active,
    /// Deactivated; jobs targeting it fail before any network call.
    Inactive,
}

/// External generation endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    /// Row identifier.
    pub id: ProviderId,
    /// Base URL of the generation endpoint.
    pub base_url: Url,
    /// Bearer token presented to the endpoint.
    pub auth_token: String,
    /// Activation state.
    pub status: ProviderStatus,
    /// User credited with the revenue share for successful jobs.
    pub owner_user_id: UserId,
}

impl Provider {
    /// Whether the provider currently accepts generation requests.
    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }
}

/// Errors raised by provider repository adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderRepositoryError {
    /// Repository connection could not be established.
    #[error("provider repository connection failed: {message}")]
    Connection { message: String },
    /// Query failed during execution.
    #[error("provider repository query failed: {message}")]
    Query { message: String },
}

impl ProviderRepositoryError {
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

/// Port for provider lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// Find a provider by its id.
    async fn find_by_id(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<Provider>, ProviderRepositoryError>;
}

/// Fixture implementation for tests that do not exercise provider lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureProviderRepository;

#[async_trait]
impl ProviderRepository for FixtureProviderRepository {
    async fn find_by_id(
        &self,
        _provider_id: ProviderId,
    ) -> Result<Option<Provider>, ProviderRepositoryError> {
        Ok(None)
    }
}
