//! Port for minting short-lived scoped access tokens.
//!
//! When a mutation's source image is not publicly published, the external
//! provider still needs to fetch it. The minter produces an opaque,
//! short-lived token scoped to one creation; minting failure is tolerated by
//! callers, which fall back to the unscoped reference.

use async_trait::async_trait;

use crate::domain::identity::CreationId;

/// Errors raised by access token minter adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessTokenError {
    /// Token backend rejected the mint.
    #[error("access token mint failed: {message}")]
    Mint { message: String },
}

impl AccessTokenError {
    /// Helper for mint failures.
    pub fn mint(message: impl Into<String>) -> Self {
        Self::Mint {
            message: message.into(),
        }
    }
}

/// Port for minting a scoped image-access token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessTokenMinter: Send + Sync {
    /// Mint a short-lived token granting read access to one creation's
    /// stored image.
    async fn mint(&self, creation_id: CreationId) -> Result<String, AccessTokenError>;
}

/// Fixture implementation minting predictable tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureAccessTokenMinter;

#[async_trait]
impl AccessTokenMinter for FixtureAccessTokenMinter {
    async fn mint(&self, creation_id: CreationId) -> Result<String, AccessTokenError> {
        Ok(format!("fixture-token-{creation_id}"))
    }
}
