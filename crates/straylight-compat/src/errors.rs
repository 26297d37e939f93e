//! Upstream error normalization.
//!
//! Whatever the upstream produced - a transport failure, an HTTP status,
//! or a structured error body - leaves this module as one of the taxonomy
//! kinds with a deterministic code and, for the timeout/connection/
//! authentication cases, a rewritten user-facing message.

use log::debug;

use straylight_common::error::{ErrorKind, ProxyError};

/// Preferred phrasings for the cases where upstream messages are
/// routinely unhelpful.
const TIMEOUT_MESSAGE: &str = "Request timed out. The upstream provider did not respond in time.";
const CONNECTION_MESSAGE: &str = "Unable to connect to the upstream provider.";
const AUTHENTICATION_MESSAGE: &str =
    "Authentication with the upstream provider failed. Check the configured API key.";

/// Maps an HTTP status onto a taxonomy kind.
#[must_use]
pub const fn kind_for_status(status: u16) -> ErrorKind {
    ErrorKind::from_status(status)
}

/// Normalizes an upstream failure into the taxonomy.
///
/// The upstream body's message is preserved except for the timeout,
/// connection, and authentication cases, whose phrasings are rewritten
/// for clarity. The original message survives in the log.
#[must_use]
pub fn normalize(error: ProxyError, provider: &str) -> ProxyError {
    let rewritten = match error.kind {
        ErrorKind::TimeoutError => Some(TIMEOUT_MESSAGE),
        ErrorKind::ConnectionError => Some(CONNECTION_MESSAGE),
        ErrorKind::AuthenticationError => Some(AUTHENTICATION_MESSAGE),
        _ => None,
    };

    match rewritten {
        Some(message) => {
            debug!(
                "normalized {} from '{provider}': {}",
                error.kind, error.message
            );
            ProxyError {
                message: message.to_string(),
                ..error
            }
        }
        None => error,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(kind_for_status(401), ErrorKind::AuthenticationError);
        assert_eq!(kind_for_status(403), ErrorKind::QuotaExceededError);
        assert_eq!(kind_for_status(404), ErrorKind::NotFoundError);
        assert_eq!(kind_for_status(408), ErrorKind::TimeoutError);
        assert_eq!(kind_for_status(429), ErrorKind::RateLimitError);
        assert_eq!(kind_for_status(422), ErrorKind::ValidationError);
        assert_eq!(kind_for_status(500), ErrorKind::ApiError);
        assert_eq!(kind_for_status(503), ErrorKind::ApiError);
    }

    #[test]
    fn test_preferred_phrasings() {
        let err = normalize(
            ProxyError::new(ErrorKind::TimeoutError, "deadline has elapsed"),
            "deepseek",
        );
        assert_eq!(err.message, TIMEOUT_MESSAGE);
        assert_eq!(err.code, "TIMEOUT_ERROR");

        let err = normalize(
            ProxyError::new(ErrorKind::AuthenticationError, "401 unauthorized"),
            "deepseek",
        );
        assert_eq!(err.message, AUTHENTICATION_MESSAGE);
    }

    #[test]
    fn test_upstream_message_preserved_otherwise() {
        let err = normalize(
            ProxyError::new(ErrorKind::RateLimitError, "tokens per minute exceeded"),
            "deepseek",
        );
        assert_eq!(err.message, "tokens per minute exceeded");
    }
}
