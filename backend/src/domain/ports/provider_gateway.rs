//! Port for the outbound provider generation call.
//!
//! The gateway owns transport only: it sends one generation request, enforces
//! the bounded timeout, and normalises the response into image bytes plus
//! declared attributes, or a structured error carrying a size-capped preview
//! of the provider's error body.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Request payload handed to the provider endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Provider method name.
    pub method: String,
    /// Provider-specific request arguments.
    pub args: Map<String, Value>,
}

/// Image attributes declared by the provider, defaulted when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttributes {
    /// Declared image width.
    pub width: u32,
    /// Declared image height.
    pub height: u32,
    /// Declared dominant colour, when present.
    pub color: Option<String>,
}

/// Successful gateway response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayImage {
    /// Raw image bytes as returned by the provider.
    pub bytes: Vec<u8>,
    /// Declared or defaulted image attributes.
    pub attributes: ImageAttributes,
}

/// Errors raised by provider gateway adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderGatewayError {
    /// The call exceeded the bounded deadline; the underlying request was
    /// aborted, not abandoned.
    #[error("provider call timed out: {message}")]
    Timeout { message: String },
    /// The provider responded with a non-success status.
    #[error("provider returned status {status}: {body_preview}")]
    Status { status: u16, body_preview: String },
    /// Transport-level failure short of a timeout.
    #[error("provider transport failed: {message}")]
    Transport { message: String },
}

impl ProviderGatewayError {
    /// Helper for deadline overruns.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Helper for non-success responses.
    pub fn status(status: u16, body_preview: impl Into<String>) -> Self {
        Self::Status {
            status,
            body_preview: body_preview.into(),
        }
    }

    /// Helper for transport failures.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Port for one bounded provider generation call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Send `payload` to `endpoint` authenticated with `auth_token`, bounded
    /// by `timeout`.
    async fn invoke(
        &self,
        endpoint: &Url,
        auth_token: &str,
        payload: &GatewayPayload,
        timeout: Duration,
    ) -> Result<GatewayImage, ProviderGatewayError>;
}

/// Fixture implementation returning a one-pixel placeholder image.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureProviderGateway;

#[async_trait]
impl ProviderGateway for FixtureProviderGateway {
    async fn invoke(
        &self,
        _endpoint: &Url,
        _auth_token: &str,
        _payload: &GatewayPayload,
        _timeout: Duration,
    ) -> Result<GatewayImage, ProviderGatewayError> {
        Ok(GatewayImage {
            bytes: vec![0],
            attributes: ImageAttributes {
                width: 1,
                height: 1,
                color: None,
            },
        })
    }
}
