//! Port for canonical image format conversion.
//!
//! Binary image manipulation is an external collaborator; the pipeline only
//! asks for "whatever the provider returned, as our canonical format".

use async_trait::async_trait;

/// Errors raised by image normaliser adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageNormalizerError {
    /// The payload is not a decodable image.
    #[error("image payload could not be decoded: {message}")]
    Undecodable { message: String },
    /// Conversion failed for an internal reason.
    #[error("image conversion failed: {message}")]
    Conversion { message: String },
}

impl ImageNormalizerError {
    /// Helper for undecodable payloads.
    pub fn undecodable(message: impl Into<String>) -> Self {
        Self::Undecodable {
            message: message.into(),
        }
    }

    /// Helper for conversion failures.
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }
}

/// Port converting provider output into the platform's canonical format.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageNormalizer: Send + Sync {
    /// Convert `bytes` into the canonical stored format.
    async fn ensure_canonical_format(
        &self,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, ImageNormalizerError>;
}

/// Fixture implementation that passes bytes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureImageNormalizer;

#[async_trait]
impl ImageNormalizer for FixtureImageNormalizer {
    async fn ensure_canonical_format(
        &self,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, ImageNormalizerError> {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn fixture_passes_bytes_through() {
        let normalizer = FixtureImageNormalizer;
        let bytes = normalizer
            .ensure_canonical_format(vec![9, 8, 7])
            .await
            .expect("fixture conversion succeeds");
        assert_eq!(bytes, vec![9, 8, 7]);
    }

    #[rstest]
    fn undecodable_error_formats_message() {
        let err = ImageNormalizerError::undecodable("not an image");
        assert!(err.to_string().contains("not an image"));
    }
}
