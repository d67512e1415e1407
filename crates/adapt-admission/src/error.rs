//! Failure taxonomy for the admission pipeline.
//!
//! Every stage returns one of these values instead of panicking. The
//! status/code table in [`AdmissionError::status`] and
//! [`AdmissionError::code`] is the only place a failure kind is turned into
//! an HTTP-style outcome.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reasons a bearer credential is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// No credential was supplied with the request.
    #[error("No credential supplied")]
    Missing,

    /// The credential could not be parsed into claims.
    #[error("Malformed credential: {0}")]
    Malformed(String),

    /// The claims failed the integrity check.
    #[error("Credential signature is invalid")]
    InvalidSignature,

    /// The credential is past its expiry.
    #[error("Credential expired at {}", .0.to_rfc3339())]
    Expired(DateTime<Utc>),
}

/// Failures talking to the shared counter/cache store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The call did not complete within its bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something other than what was asked for.
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// Failures reported by resource handlers.
///
/// These pass through the pipeline with their message intact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

/// Errors produced anywhere in the admission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// Credential missing, malformed, tampered with or expired.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The identity's role does not grant the capability.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The throttle window for this key is exhausted.
    #[error("Too many requests, please try again later.")]
    RateLimitExceeded {
        /// Time left in the current window.
        retry_after: Duration,
    },

    /// The shared store failed under a fail-closed policy, or a write could
    /// not be followed by its cache invalidation.
    #[error("Service temporarily unavailable: {0}")]
    UpstreamUnavailable(#[from] StoreError),

    /// Failure reported by the resource handler.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The pipeline was assembled with unusable settings.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl AdmissionError {
    /// HTTP status this failure is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Credential(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Resource(ResourceError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Resource(ResourceError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Resource(ResourceError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Resource(ResourceError::Internal(_)) | Self::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Credential(CredentialError::Missing) => "CREDENTIAL_MISSING",
            Self::Credential(CredentialError::Malformed(_)) => "CREDENTIAL_MALFORMED",
            Self::Credential(CredentialError::InvalidSignature) => "INVALID_SIGNATURE",
            Self::Credential(CredentialError::Expired(_)) => "CREDENTIAL_EXPIRED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::UpstreamUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Resource(ResourceError::NotFound(_)) => "NOT_FOUND",
            Self::Resource(ResourceError::Validation(_)) => "VALIDATION_ERROR",
            Self::Resource(ResourceError::Conflict(_)) => "CONFLICT",
            Self::Resource(ResourceError::Internal(_)) | Self::Configuration(_) => {
                "INTERNAL_SERVER_ERROR"
            }
        }
    }

    /// Human-readable message for the error body.
    ///
    /// Store and configuration details stay in the logs.
    pub fn message(&self) -> String {
        match self {
            Self::UpstreamUnavailable(_) => {
                "The service is temporarily unavailable, please retry shortly.".to_string()
            }
            Self::Configuration(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Suggested delay before retrying, when the failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the failure was caused by the store rather than the caller.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

/// Uniform error body: `{ "error": { "code", "message" } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl From<&AdmissionError> for ErrorBody {
    fn from(err: &AdmissionError) -> Self {
        Self {
            error: ErrorDetail {
                code: err.code().to_string(),
                message: err.message(),
            },
        }
    }
}
