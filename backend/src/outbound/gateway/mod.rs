//! Reqwest-backed provider gateway adapter.
//!
//! This adapter owns transport details only: request serialisation, the
//! per-call timeout, HTTP error mapping with a size-capped body preview, and
//! decoding of the declared image attribute headers.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

use crate::domain::ports::{
    GatewayImage, GatewayPayload, ImageAttributes, ProviderGateway, ProviderGatewayError,
};

const DEFAULT_PREVIEW_CHAR_LIMIT: usize = 500;
const DEFAULT_IMAGE_DIMENSION: u32 = 1024;
const DEFAULT_USER_AGENT: &str = "creation-pipeline-gateway/0.1";

const WIDTH_HEADER: &str = "x-image-width";
const HEIGHT_HEADER: &str = "x-image-height";
const COLOR_HEADER: &str = "x-image-color";

/// Outbound identity and response-shape defaults for provider requests.
pub struct ProviderHttpIdentity {
    /// HTTP user-agent sent to providers.
    pub user_agent: String,
    /// Character cap applied to error body previews.
    pub preview_char_limit: usize,
    /// Width assumed when the provider declares none.
    pub default_width: u32,
    /// Height assumed when the provider declares none.
    pub default_height: u32,
}

impl Default for ProviderHttpIdentity {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            preview_char_limit: DEFAULT_PREVIEW_CHAR_LIMIT,
            default_width: DEFAULT_IMAGE_DIMENSION,
            default_height: DEFAULT_IMAGE_DIMENSION,
        }
    }
}

/// Provider gateway adapter that performs HTTP POST requests with a bounded
/// per-call deadline. The deadline aborts the in-flight request rather than
/// abandoning it.
pub struct HttpProviderGateway {
    client: Client,
    user_agent: String,
    preview_char_limit: usize,
    default_width: u32,
    default_height: u32,
}

impl HttpProviderGateway {
    /// Build an adapter with default identity settings.
    ///
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_identity(ProviderHttpIdentity::default())
    }

    /// Build an adapter with explicit outbound identity settings.
    ///
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn with_identity(identity: ProviderHttpIdentity) -> Result<Self, reqwest::Error> {
        // No client-level timeout: each call carries its own deadline.
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            user_agent: identity.user_agent,
            preview_char_limit: identity.preview_char_limit.max(1),
            default_width: identity.default_width,
            default_height: identity.default_height,
        })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn invoke(
        &self,
        endpoint: &Url,
        auth_token: &str,
        payload: &GatewayPayload,
        timeout: Duration,
    ) -> Result<GatewayImage, ProviderGatewayError> {
        let response = self
            .client
            .post(endpoint.clone())
            .timeout(timeout)
            .bearer_auth(auth_token)
            .header(reqwest::header::USER_AGENT, self.user_agent.as_str())
            .json(payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(
                status,
                body.as_ref(),
                self.preview_char_limit,
            ));
        }

        let attributes =
            parse_attributes(&headers, self.default_width, self.default_height);
        Ok(GatewayImage {
            bytes: body.to_vec(),
            attributes,
        })
    }
}

fn parse_attributes(headers: &HeaderMap, default_width: u32, default_height: u32) -> ImageAttributes {
    ImageAttributes {
        width: header_u32(headers, WIDTH_HEADER).unwrap_or(default_width),
        height: header_u32(headers, HEIGHT_HEADER).unwrap_or(default_height),
        color: headers
            .get(COLOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
    }
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn map_transport_error(error: reqwest::Error) -> ProviderGatewayError {
    if error.is_timeout() {
        ProviderGatewayError::timeout(error.to_string())
    } else {
        ProviderGatewayError::transport(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &[u8], limit: usize) -> ProviderGatewayError {
    ProviderGatewayError::status(status.as_u16(), body_preview(body, limit))
}

fn body_preview(body: &[u8], limit: usize) -> String {
    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview = compact.chars().take(limit).collect::<String>();
    if compact.chars().count() > limit {
        format!("{preview}...")
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for non-network gateway mapping helpers.

    use reqwest::header::HeaderValue;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::short(b"service exploded".as_slice(), "service exploded")]
    #[case::whitespace_compacted(b"line one\n\n  line\ttwo".as_slice(), "line one line two")]
    #[case::empty(b"".as_slice(), "")]
    fn previews_compact_whitespace(#[case] body: &[u8], #[case] expected: &str) {
        assert_eq!(body_preview(body, 500), expected);
    }

    #[test]
    fn previews_are_capped_with_an_ellipsis() {
        let body = "x".repeat(600);
        let preview = body_preview(body.as_bytes(), 500);

        assert_eq!(preview.chars().count(), 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn status_errors_carry_the_capped_preview() {
        let error = map_status_error(StatusCode::INTERNAL_SERVER_ERROR, b"boom", 500);

        assert_eq!(
            error,
            ProviderGatewayError::status(500, "boom")
        );
    }

    #[rstest]
    #[case::declared(Some("512"), Some("768"), Some("aabbcc"), 512, 768, Some("aabbcc"))]
    #[case::defaulted(None, None, None, 1024, 1024, None)]
    #[case::unparsable(Some("wide"), Some(""), None, 1024, 1024, None)]
    fn attributes_fall_back_to_defaults(
        #[case] width: Option<&str>,
        #[case] height: Option<&str>,
        #[case] color: Option<&str>,
        #[case] expected_width: u32,
        #[case] expected_height: u32,
        #[case] expected_color: Option<&str>,
    ) {
        let mut headers = HeaderMap::new();
        if let Some(width) = width {
            headers.insert(WIDTH_HEADER, HeaderValue::from_str(width).unwrap());
        }
        if let Some(height) = height {
            headers.insert(HEIGHT_HEADER, HeaderValue::from_str(height).unwrap());
        }
        if let Some(color) = color {
            headers.insert(COLOR_HEADER, HeaderValue::from_str(color).unwrap());
        }

        let attributes = parse_attributes(&headers, 1024, 1024);

        assert_eq!(attributes.width, expected_width);
        assert_eq!(attributes.height, expected_height);
        assert_eq!(attributes.color.as_deref(), expected_color);
    }
}
