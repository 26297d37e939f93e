//! Error taxonomy shared by every pipeline stage.
//!
//! The wire-level names (`validation_error`, `rate_limit_error`, ...) are a
//! contract with external callers: the egress envelope for a failed request
//! always serializes as `{"error":{"message","type","code","param"}}` with
//! `type` drawn from [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The failure categories a request can surface with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed or rejected input (bad tool definition, empty messages).
    ValidationError,
    /// Structural violation of a wire format; carries a subcode.
    ProtocolError,
    /// Credentials missing, invalid, or revoked (HTTP 401).
    AuthenticationError,
    /// Too many requests (HTTP 429).
    RateLimitError,
    /// The per-request deadline elapsed.
    TimeoutError,
    /// The upstream could not be reached.
    ConnectionError,
    /// Unknown model or endpoint (HTTP 404).
    NotFoundError,
    /// Account quota exhausted.
    QuotaExceededError,
    /// Transport-level failure other than connect/timeout.
    NetworkError,
    /// The upstream returned an error body or a 5xx.
    ApiError,
    /// The router found no healthy pipeline for the request.
    NoHealthyPipeline,
    /// A mutation was attempted on a sealed pipeline.
    PipelineSealed,
    /// A stage was invoked before `start()` or after `stop()`.
    ModuleNotRunning,
    /// The request was cancelled before producing a reply.
    Cancelled,
}

impl ErrorKind {
    /// Wire name used in the egress envelope's `type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::ProtocolError => "protocol_error",
            Self::AuthenticationError => "authentication_error",
            Self::RateLimitError => "rate_limit_error",
            Self::TimeoutError => "timeout_error",
            Self::ConnectionError => "connection_error",
            Self::NotFoundError => "not_found_error",
            Self::QuotaExceededError => "quota_exceeded_error",
            Self::NetworkError => "network_error",
            Self::ApiError => "api_error",
            Self::NoHealthyPipeline => "no_healthy_pipeline",
            Self::PipelineSealed => "pipeline_sealed",
            Self::ModuleNotRunning => "module_not_running",
            Self::Cancelled => "cancelled",
        }
    }

    /// Default `code` derived from the kind (e.g. `RATE_LIMIT_ERROR`).
    #[must_use]
    pub const fn default_code(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::RateLimitError => "RATE_LIMIT_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::NotFoundError => "NOT_FOUND_ERROR",
            Self::QuotaExceededError => "QUOTA_EXCEEDED_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ApiError => "API_ERROR",
            Self::NoHealthyPipeline => "NO_HEALTHY_PIPELINE",
            Self::PipelineSealed => "PIPELINE_SEALED",
            Self::ModuleNotRunning => "MODULE_NOT_RUNNING",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl ErrorKind {
    /// The taxonomy kind an upstream HTTP status maps onto.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 => Self::AuthenticationError,
            402 | 403 => Self::QuotaExceededError,
            404 => Self::NotFoundError,
            408 => Self::TimeoutError,
            429 => Self::RateLimitError,
            400..=499 => Self::ValidationError,
            _ => Self::ApiError,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural wire-format violations reported by the protocol controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolViolation {
    InvalidModelField,
    InvalidMessagesField,
    RequestSizeExceeded,
    UnsupportedRequestFormat,
    UnsupportedResponseFormat,
    MissingModel,
    InvalidMessages,
    InvalidStreamFlag,
    InvalidMessageRole,
    EmptyMessageContent,
    MissingResponseId,
    InvalidResponseObject,
    MissingResponseChoices,
    MissingUsageInfo,
    EmptyChunksList,
}

impl ProtocolViolation {
    /// Subcode placed in the envelope's `code` field.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidModelField => "INVALID_MODEL_FIELD",
            Self::InvalidMessagesField => "INVALID_MESSAGES_FIELD",
            Self::RequestSizeExceeded => "REQUEST_SIZE_EXCEEDED",
            Self::UnsupportedRequestFormat => "UNSUPPORTED_REQUEST_FORMAT",
            Self::UnsupportedResponseFormat => "UNSUPPORTED_RESPONSE_FORMAT",
            Self::MissingModel => "MISSING_MODEL",
            Self::InvalidMessages => "INVALID_MESSAGES",
            Self::InvalidStreamFlag => "INVALID_STREAM_FLAG",
            Self::InvalidMessageRole => "INVALID_MESSAGE_ROLE",
            Self::EmptyMessageContent => "EMPTY_MESSAGE_CONTENT",
            Self::MissingResponseId => "MISSING_RESPONSE_ID",
            Self::InvalidResponseObject => "INVALID_RESPONSE_OBJECT",
            Self::MissingResponseChoices => "MISSING_RESPONSE_CHOICES",
            Self::MissingUsageInfo => "MISSING_USAGE_INFO",
            Self::EmptyChunksList => "EMPTY_CHUNKS_LIST",
        }
    }
}

/// A failure surfaced by any stage of the pipeline.
///
/// Carries enough to render the egress envelope and to attribute the
/// failure to the module that produced it.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ProxyError {
    /// Taxonomy category.
    pub kind: ErrorKind,
    /// Human-readable description; upstream bodies are preserved here
    /// unless adapter policy rewrites them for clarity.
    pub message: String,
    /// Machine-readable code (taxonomy default or protocol subcode).
    pub code: String,
    /// Offending parameter, when one can be named.
    pub param: Option<String>,
    /// Id of the module that raised the error.
    pub module: Option<String>,
}

impl ProxyError {
    /// Creates an error with the kind's default code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: kind.default_code().to_string(),
            param: None,
            module: None,
        }
    }

    /// Creates a `protocol_error` carrying the violation subcode.
    pub fn protocol(violation: ProtocolViolation, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ProtocolError,
            message: message.into(),
            code: violation.code().to_string(),
            param: None,
            module: None,
        }
    }

    /// Creates a `validation_error` with an explicit code.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ValidationError,
            message: message.into(),
            code: code.to_string(),
            param: None,
            module: None,
        }
    }

    /// Attaches the offending parameter name.
    #[must_use]
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Attributes the error to a module; an existing attribution is kept
    /// so the innermost failing stage stays visible.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        if self.module.is_none() {
            self.module = Some(module.into());
        }
        self
    }

    /// Whether a retry at a higher layer could plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TimeoutError
                | ErrorKind::ConnectionError
                | ErrorKind::RateLimitError
                | ErrorKind::NetworkError
        )
    }

    /// Whether this is a credentials failure (drives key rotation).
    #[must_use]
    pub const fn is_authentication_error(&self) -> bool {
        matches!(self.kind, ErrorKind::AuthenticationError)
    }

    /// HTTP status the out-of-scope edge maps this kind to.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::ValidationError | ErrorKind::ProtocolError => 400,
            ErrorKind::AuthenticationError => 401,
            ErrorKind::NotFoundError => 404,
            ErrorKind::TimeoutError => 408,
            ErrorKind::RateLimitError | ErrorKind::QuotaExceededError => 429,
            ErrorKind::NoHealthyPipeline => 503,
            _ => 500,
        }
    }
}

/// The egress envelope for a failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error body.
    pub error: ErrorBody,
}

/// Body of the egress error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// User-facing message.
    pub message: String,
    /// Taxonomy name (`validation_error`, `api_error`, ...).
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable code.
    pub code: String,
    /// Offending parameter, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl From<&ProxyError> for ErrorEnvelope {
    fn from(err: &ProxyError) -> Self {
        Self {
            error: ErrorBody {
                message: err.message.clone(),
                error_type: err.kind.as_str().to_string(),
                code: err.code.clone(),
                param: err.param.clone(),
            },
        }
    }
}

impl From<ProxyError> for ErrorEnvelope {
    fn from(err: ProxyError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let err = ProxyError::new(ErrorKind::RateLimitError, "slow down").with_param("model");
        let envelope = ErrorEnvelope::from(&err);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["code"], "RATE_LIMIT_ERROR");
        assert_eq!(json["error"]["message"], "slow down");
        assert_eq!(json["error"]["param"], "model");
    }

    #[test]
    fn test_protocol_subcode_preserved() {
        let err = ProxyError::protocol(ProtocolViolation::MissingModel, "no model field");
        assert_eq!(err.kind, ErrorKind::ProtocolError);
        assert_eq!(err.code, "MISSING_MODEL");
    }

    #[test]
    fn test_module_attribution_keeps_innermost() {
        let err = ProxyError::new(ErrorKind::ApiError, "boom")
            .with_module("upstream")
            .with_module("pipeline");
        assert_eq!(err.module.as_deref(), Some("upstream"));
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ProxyError::new(ErrorKind::ValidationError, "x").http_status(), 400);
        assert_eq!(ProxyError::new(ErrorKind::AuthenticationError, "x").http_status(), 401);
        assert_eq!(ProxyError::new(ErrorKind::NotFoundError, "x").http_status(), 404);
        assert_eq!(ProxyError::new(ErrorKind::TimeoutError, "x").http_status(), 408);
        assert_eq!(ProxyError::new(ErrorKind::NoHealthyPipeline, "x").http_status(), 503);
        assert_eq!(ProxyError::new(ErrorKind::NetworkError, "x").http_status(), 500);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ProxyError::new(ErrorKind::TimeoutError, "x").is_retryable());
        assert!(ProxyError::new(ErrorKind::ConnectionError, "x").is_retryable());
        assert!(!ProxyError::new(ErrorKind::ValidationError, "x").is_retryable());
        assert!(!ProxyError::new(ErrorKind::Cancelled, "x").is_retryable());
    }
}
