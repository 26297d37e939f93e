//! # straylight-upstream
//!
//! The last pipeline stage: HTTPS dispatch to the concrete provider.
//!
//! Non-stream only - the protocol controller has already collapsed any
//! stream request, so a stream flag reaching this layer is a protocol
//! error. Transport resilience comes from the reqwest middleware stack
//! (Retry-After first, then exponential backoff); credential resilience
//! comes from 401-driven key rotation over the provider's [`KeyRing`].
//!
//! API keys live in `secrecy::SecretString` and never appear in `Debug`
//! output or logs.

use std::time::Duration;

use log::{debug, error, warn};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use reqwest_retry_after::RetryAfterMiddleware;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use straylight_common::config::{AuthConfig, ProviderFamily, ProviderRecord};
use straylight_common::error::{ErrorKind, ProtocolViolation, ProxyError};
use straylight_common::generative::GenerateRequest;
use straylight_common::payload::Payload;

mod keyring;
pub use keyring::KeyRing;

/// Error body shape most providers return.
#[derive(Debug, serde::Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

/// The message inside a provider error body.
#[derive(Debug, serde::Deserialize)]
struct ErrorDetail {
    message: String,
}

/// HTTPS client for one provider endpoint.
///
/// Shared across every pipeline that points at the same provider and key
/// set; connections and the rotation cursor are its only mutable state.
#[derive(Clone)]
pub struct UpstreamClient {
    client: ClientWithMiddleware,
    base_url: String,
    auth: AuthConfig,
    keys: KeyRing,
    family: ProviderFamily,
    provider_name: String,
    skip_authentication: bool,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("provider", &self.provider_name)
            .field("base_url", &self.base_url)
            .field("family", &self.family)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Builds a client from a provider record.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the base URL does not parse or the
    /// HTTP client cannot be constructed.
    pub fn from_record(record: &ProviderRecord) -> Result<Self, ProxyError> {
        url::Url::parse(&record.base_url).map_err(|e| {
            ProxyError::validation(
                "INVALID_BASE_URL",
                format!("provider '{}' base_url does not parse: {e}", record.name),
            )
        })?;

        let reqwest_client = reqwest::Client::builder()
            .timeout(record.timeout())
            .build()
            .map_err(|e| {
                ProxyError::new(
                    ErrorKind::NetworkError,
                    format!("failed to build HTTP client: {e}"),
                )
            })?;

        // Retry-After must sit in front of the transient-retry middleware
        // so provider-specified delays win over exponential backoff.
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), Duration::from_secs(30))
            .build_with_max_retries(record.max_retries);
        let client = reqwest_middleware::ClientBuilder::new(reqwest_client)
            .with(RetryAfterMiddleware::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            base_url: record.base_url.trim_end_matches('/').to_string(),
            auth: record.auth.clone(),
            keys: KeyRing::new(record.keys(), record.key_strategy),
            family: record.family,
            provider_name: record.name.clone(),
            skip_authentication: record.skip_authentication,
        })
    }

    /// The configured provider name.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Probes credentials against the model-list endpoint.
    ///
    /// Skipped entirely when the provider record sets
    /// `skip_authentication` or configures no keys (local servers).
    ///
    /// # Errors
    ///
    /// Returns `authentication_error` on a 401, `connection_error` when
    /// the endpoint is unreachable.
    pub async fn authenticate(&self) -> Result<(), ProxyError> {
        if self.skip_authentication || self.keys.is_empty() {
            debug!("'{}': skipping auth probe", self.provider_name);
            return Ok(());
        }

        let index = self.keys.select().unwrap_or(0);
        let key = self.keys.key_at(index).ok_or_else(|| {
            ProxyError::new(ErrorKind::AuthenticationError, "no API key configured")
        })?;

        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header(self.auth.header.as_str(), self.auth.render(key.expose_secret()))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if response.status().as_u16() == 401 {
            return Err(ProxyError::new(
                ErrorKind::AuthenticationError,
                format!("auth probe rejected for provider '{}'", self.provider_name),
            ));
        }
        Ok(())
    }

    /// Cheap reachability check used by pipeline validation.
    pub async fn health_check(&self) -> bool {
        let request = self.client.get(format!("{}/models", self.base_url));
        match request.send().await {
            Ok(_) => true,
            Err(e) => {
                warn!("'{}' health check failed: {e}", self.provider_name);
                false
            }
        }
    }

    /// Dispatches a request payload to the provider.
    ///
    /// Chat requests go to `chat/completions`; generative requests go to
    /// the model-scoped `generateContent` endpoint. The raw response body
    /// is returned for the compat stage to repair.
    ///
    /// # Errors
    ///
    /// `INVALID_STREAM_FLAG` when a stream request reaches this layer;
    /// otherwise the normalized upstream failure.
    pub async fn process(&self, payload: Payload) -> Result<Payload, ProxyError> {
        match payload {
            Payload::ChatRequest(request) => {
                if request.stream == Some(true) {
                    return Err(ProxyError::protocol(
                        ProtocolViolation::InvalidStreamFlag,
                        "stream requests must be collapsed before upstream dispatch",
                    ));
                }
                let url = format!("{}/chat/completions", self.base_url);
                let body = serde_json::to_value(&request).map_err(|e| {
                    ProxyError::new(ErrorKind::ApiError, format!("request serialization: {e}"))
                })?;
                self.dispatch_with_rotation(&url, &body).await.map(Payload::Raw)
            }
            Payload::GenerativeRequest(request) => {
                let url = self.generative_url(&request);
                let body = serde_json::to_value(&request.request).map_err(|e| {
                    ProxyError::new(ErrorKind::ApiError, format!("request serialization: {e}"))
                })?;
                self.dispatch_with_rotation(&url, &body).await.map(Payload::Raw)
            }
            other => Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!("upstream client cannot dispatch {}", other.kind_name()),
            )),
        }
    }

    fn generative_url(&self, request: &GenerateRequest) -> String {
        match &request.project {
            Some(project) => format!(
                "{}/projects/{project}/models/{}:generateContent",
                self.base_url, request.model
            ),
            None => format!("{}/models/{}:generateContent", self.base_url, request.model),
        }
    }

    /// Sends the request, rotating to the next key on a 401 up to
    /// `keyCount - 1` times. Any other failure propagates immediately.
    async fn dispatch_with_rotation(&self, url: &str, body: &Value) -> Result<Value, ProxyError> {
        if self.keys.is_empty() {
            // Local servers run without credentials.
            return self.send_once(url, body, None).await;
        }

        let mut index = self.keys.select().unwrap_or(0);
        let attempts = self.keys.len();

        for attempt in 0..attempts {
            let key = self.keys.key_at(index);
            match self.send_once(url, body, key).await {
                Err(e) if e.is_authentication_error() && attempt + 1 < attempts => {
                    warn!(
                        "'{}': key #{index} rejected (401), rotating",
                        self.provider_name
                    );
                    index = self.keys.next_after(index);
                }
                other => return other,
            }
        }

        Err(ProxyError::new(
            ErrorKind::AuthenticationError,
            format!(
                "all {attempts} configured keys rejected for provider '{}'",
                self.provider_name
            ),
        ))
    }

    async fn send_once(
        &self,
        url: &str,
        body: &Value,
        key: Option<&SecretString>,
    ) -> Result<Value, ProxyError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = key {
            request = request.header(self.auth.header.as_str(), self.auth.render(key.expose_secret()));
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ProxyError::new(ErrorKind::NetworkError, format!("failed to read body: {e}"))
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map_or(text, |parsed| parsed.error.message);
            error!(
                "'{}' returned {}: {message}",
                self.provider_name,
                status.as_u16()
            );
            return Err(ProxyError::new(
                ErrorKind::from_status(status.as_u16()),
                message,
            ));
        }

        serde_json::from_str(&text).map_err(|e| {
            ProxyError::new(
                ErrorKind::ApiError,
                format!("upstream returned non-JSON body: {e}"),
            )
        })
    }

    fn transport_error(&self, error: &reqwest_middleware::Error) -> ProxyError {
        let is_timeout = matches!(error, reqwest_middleware::Error::Reqwest(e) if e.is_timeout());
        let is_connect = matches!(error, reqwest_middleware::Error::Reqwest(e) if e.is_connect());

        let kind = if is_timeout {
            ErrorKind::TimeoutError
        } else if is_connect {
            ErrorKind::ConnectionError
        } else {
            ErrorKind::NetworkError
        };
        ProxyError::new(
            kind,
            format!("'{}' transport failure: {error}", self.provider_name),
        )
    }
}
