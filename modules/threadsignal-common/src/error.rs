use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ThreadError>;

/// Errors surfaced by the aggregation engine.
///
/// `Clone` so a single failed authentication can be handed to every caller
/// waiting on the same in-flight exchange.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThreadError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A 401 from an authenticated endpoint. Callers refresh once, then
    /// escalate to `AuthenticationFailed`.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid thread reference: {0}")]
    InvalidReference(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ThreadError {
    /// Whether the transport should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ThreadError::TransientNetwork(_) | ThreadError::RateLimited { .. }
        )
    }

    /// Retry-after hint carried by a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ThreadError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ThreadError {
    fn from(err: serde_json::Error) -> Self {
        ThreadError::MalformedPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_rate_limit_errors_retry() {
        assert!(ThreadError::TransientNetwork("reset".into()).is_retryable());
        assert!(ThreadError::RateLimited {
            retry_after: None,
            message: "429".into()
        }
        .is_retryable());
        assert!(!ThreadError::NotFound("x".into()).is_retryable());
        assert!(!ThreadError::Unauthorized("x".into()).is_retryable());
        assert!(!ThreadError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn serde_errors_become_malformed_payload() {
        let err: ThreadError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ThreadError::MalformedPayload(_)));
    }
}
