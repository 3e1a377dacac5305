//! Error types for ct-archive-serve
//!
//! This module defines the common error type used throughout the service.

use thiserror::Error;

/// Common result type for ct-archive-serve operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ct-archive-serve
#[derive(Debug, Error)]
pub enum Error {
    /// The requested content does not exist (missing zip part, missing entry,
    /// unknown log).
    #[error("not found")]
    NotFound,

    /// A zip part exists but is not currently usable (still downloading,
    /// structurally invalid, or a read against it failed).
    #[error("zip temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// Two archive folders map to the same log name after prefix stripping.
    #[error("archive folder collision for log {log:?}: {first:?} and {second:?}")]
    LogNameCollision {
        log: String,
        first: String,
        second: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a temporarily-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::TemporarilyUnavailable(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this is a temporarily-unavailable error
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::TemporarilyUnavailable(_))
    }

    /// Get the HTTP status code for handler-level error mapping
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 404 Not Found
            Self::NotFound => 404,

            // 503 Service Unavailable
            Self::TemporarilyUnavailable(_) => 503,

            // 500 Internal Server Error
            Self::LogNameCollision { .. }
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::unavailable("x").is_not_found());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::NotFound.http_status_code(), 404);
        assert_eq!(Error::unavailable("truncated").http_status_code(), 503);
        assert_eq!(Error::internal("boom").http_status_code(), 500);
        assert_eq!(
            Error::LogNameCollision {
                log: "a".into(),
                first: "ct_a".into(),
                second: "mirror_a".into(),
            }
            .http_status_code(),
            500
        );
    }

    #[test]
    fn test_error_display_does_not_leak_paths() {
        // Fixed opaque top-level messages; detail is appended context only.
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert!(Error::unavailable("open zip: bad magic")
            .to_string()
            .starts_with("zip temporarily unavailable"));
    }
}
