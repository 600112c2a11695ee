//! Single generation attempt shared by the three job variants.
//!
//! Authenticated creations, anonymous trials, and landscape jobs all run the
//! same gateway -> normalise -> upload sequence; only their gating and
//! reconciliation differ. Failures come back as [`JobFailure`] values for the
//! caller to reconcile, never as propagated errors.

use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::creation::JobFailure;
use super::ports::{
    GatewayPayload, ImageAttributes, ImageNormalizer, Provider, ProviderGateway,
    ProviderGatewayError, StorageSink,
};

/// Driven ports needed for one generation attempt.
pub(crate) struct GenerationDeps<'a> {
    pub gateway: &'a dyn ProviderGateway,
    pub normalizer: &'a dyn ImageNormalizer,
    pub storage: &'a dyn StorageSink,
}

/// Durable artifact produced by a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GeneratedArtifact {
    pub filename: String,
    pub url: String,
    pub attributes: ImageAttributes,
}

/// Fresh storage key for a finished artifact under the given prefix.
pub(crate) fn artifact_filename(prefix: &str) -> String {
    format!("{prefix}/{}.png", Uuid::new_v4())
}

/// Invoke the provider, canonicalise the result, and persist it under
/// `filename`.
pub(crate) async fn run_generation(
    deps: GenerationDeps<'_>,
    provider: &Provider,
    method: &str,
    args: &Map<String, Value>,
    timeout: Duration,
    filename: String,
) -> Result<GeneratedArtifact, JobFailure> {
    let payload = GatewayPayload {
        method: method.to_owned(),
        args: args.clone(),
    };

    let image = deps
        .gateway
        .invoke(&provider.base_url, &provider.auth_token, &payload, timeout)
        .await
        .map_err(map_gateway_error)?;

    let canonical = deps
        .normalizer
        .ensure_canonical_format(image.bytes)
        .await
        .map_err(|err| JobFailure::provider_error(err.to_string(), None))?;

    let url = deps
        .storage
        .upload(canonical, &filename)
        .await
        .map_err(|err| JobFailure::upload_failed(err.to_string()))?;

    Ok(GeneratedArtifact {
        filename,
        url,
        attributes: image.attributes,
    })
}

fn map_gateway_error(error: ProviderGatewayError) -> JobFailure {
    match error {
        ProviderGatewayError::Timeout { message } => {
            JobFailure::timeout(format!("provider call exceeded the deadline: {message}"))
        }
        ProviderGatewayError::Status {
            status,
            body_preview,
        } => JobFailure::provider_error(
            format!("provider returned status {status}"),
            Some(body_preview),
        ),
        ProviderGatewayError::Transport { message } => {
            JobFailure::provider_error(message, None)
        }
    }
}
