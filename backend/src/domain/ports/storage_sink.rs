//! Port for artifact blob storage.

use async_trait::async_trait;

/// Errors raised by storage sink adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageSinkError {
    /// Storage backend is unreachable.
    #[error("storage backend failure: {message}")]
    Backend { message: String },
    /// The write or delete was rejected.
    #[error("storage operation rejected: {message}")]
    Rejected { message: String },
}

impl StorageSinkError {
    /// Helper for backend-level failures.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Helper for rejected operations.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Port for storing and deleting image artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Store `bytes` under `key` and return the stable public URL.
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageSinkError>;

    /// Delete the blob stored under `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageSinkError>;
}

/// Fixture implementation that fabricates URLs and discards bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureStorageSink;

#[async_trait]
impl StorageSink for FixtureStorageSink {
    async fn upload(&self, _bytes: Vec<u8>, key: &str) -> Result<String, StorageSinkError> {
        Ok(format!("https://storage.invalid/{key}"))
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageSinkError> {
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
    async fn fixture_upload_returns_a_url_containing_the_key() {
        let sink = FixtureStorageSink;
        let url = sink
            .upload(vec![1, 2, 3], "creations/a.png")
            .await
            .expect("fixture upload succeeds");
        assert!(url.ends_with("creations/a.png"));
    }

    #[rstest]
    fn backend_error_formats_message() {
        let err = StorageSinkError::backend("bucket offline");
        assert!(err.to_string().contains("bucket offline"));
    }
}
