//! Error types for the SafeRun core.
//!
//! Every fallible operation in the crate returns [`CoreResult`]. The error
//! taxonomy is deliberately small: each [`ErrorKind`] maps to exactly one
//! HTTP status and one machine-readable `error_code`, and the wire shape is
//! the uniform [`ErrorEnvelope`]. Tenant mismatches surface as `NotFound`,
//! never `Forbidden`, so callers cannot probe for the existence of another
//! tenant's changes.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Service name reported in error envelopes.
pub const SERVICE_NAME: &str = "saferun";

/// Crate version reported in error envelopes.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error kinds for categorizing core errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: bad target grammar, invalid field, unparsable body.
    BadRequest,
    /// Missing or invalid API key, approval token, or webhook signature.
    Unauthorized,
    /// Known caller without the required right (approval missing).
    Forbidden,
    /// Resource does not exist, including cross-tenant access.
    NotFound,
    /// State conflict: terminal status, optimistic-concurrency failure,
    /// or a lost token race.
    Conflict,
    /// Deadline passed: approval window or revert window elapsed.
    Gone,
    /// Admission rejected by the rate limiter.
    RateLimited,
    /// Upstream provider failure wrapped at the engine boundary.
    BadGateway,
    /// Unexpected internal failure (store errors during mutation).
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::RateLimited => 429,
            Self::BadGateway => 502,
            Self::Internal => 500,
        }
    }

    /// Machine-readable error code for the envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::RateLimited => "rate_limited",
            Self::BadGateway => "bad_gateway",
            Self::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_code())
    }
}

/// Core error with taxonomy kind and a short, non-sensitive message.
#[derive(Error, Debug)]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    /// Seconds until retry is allowed (rate limiting only).
    retry_after: Option<u64>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl CoreError {
    /// Creates a new error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            cause: None,
        }
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Sets the Retry-After hint in seconds.
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    /// Gets the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Gets the HTTP status code.
    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Gets the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the Retry-After hint, if any.
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    /// Renders the uniform wire envelope.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: "error",
            error_code: self.kind.error_code(),
            message: self.message.clone(),
            service: SERVICE_NAME,
            version: SERVICE_VERSION,
        }
    }

    // Convenience constructors

    /// Malformed input, identifying the offending field.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Missing or invalid credentials.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Insufficient right.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Missing resource (also used for tenant mismatch).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// State conflict.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Expired deadline.
    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Gone, message)
    }

    /// Upstream adapter failure.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadGateway, message)
    }

    /// Unexpected internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Uniform error body returned by every endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Always `"error"`.
    pub status: &'static str,
    /// Machine-readable code (snake_case).
    pub error_code: &'static str,
    /// Human-readable message. Never contains tokens or credentials.
    pub message: String,
    /// Service name.
    pub service: &'static str,
    /// Service version.
    pub version: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(ErrorKind::BadRequest.status_code(), 400);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Gone.status_code(), 410);
        assert_eq!(ErrorKind::RateLimited.status_code(), 429);
        assert_eq!(ErrorKind::BadGateway.status_code(), 502);
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::not_found("change not found");
        let display = format!("{}", err);
        assert!(display.contains("not_found"));
        assert!(display.contains("change not found"));
    }

    #[test]
    fn test_envelope_shape() {
        let err = CoreError::conflict("operation already rejected");
        let env = err.envelope();
        assert_eq!(env.status, "error");
        assert_eq!(env.error_code, "conflict");
        assert_eq!(env.service, "saferun");
    }

    #[test]
    fn test_retry_after() {
        let err = CoreError::new(ErrorKind::RateLimited, "limit exhausted").with_retry_after(120);
        assert_eq!(err.retry_after(), Some(120));
        assert_eq!(err.status_code(), 429);
    }
}
