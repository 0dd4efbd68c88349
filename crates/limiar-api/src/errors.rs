//! REST error types.

use thiserror::Error;

/// Errors returned by [`ApiClient`](crate::ApiClient).
#[derive(Debug, Error)]
pub enum ApiError {
    /// No API base URL is configured.
    #[error("Missing API base URL")]
    MissingBaseUrl,
    /// The server answered with a non-2xx status.
    #[error("{message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Server-provided message, or the status reason.
        message: String,
    },
    /// Transport failure or undecodable body.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ApiError {
    /// HTTP status, when the server answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for REST operations.
pub type Result<T> = std::result::Result<T, ApiError>;
