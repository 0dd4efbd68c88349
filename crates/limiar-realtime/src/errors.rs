//! Realtime error types.
//!
//! Only configuration problems surface as `Err` to callers. Transport
//! failures are absorbed by the connection manager and turned into state
//! transitions.

use thiserror::Error;

/// Configuration errors raised when building realtime endpoints.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// No API base URL is configured.
    #[error("Missing API base URL")]
    MissingBaseUrl,
    /// The base URL does not parse or has no host.
    #[error("invalid API base URL {url:?}: {reason}")]
    InvalidBaseUrl {
        /// The offending value.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Failures of a single physical connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The handshake did not complete in time.
    #[error("connect timed out")]
    Timeout,
    /// The peer refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),
    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_base_url_display() {
        assert_eq!(RealtimeError::MissingBaseUrl.to_string(), "Missing API base URL");
    }

    #[test]
    fn invalid_base_url_display() {
        let err = RealtimeError::InvalidBaseUrl {
            url: "::".into(),
            reason: "relative URL without a base".into(),
        };
        assert!(err.to_string().contains("\"::\""));
    }

    #[test]
    fn tungstenite_error_converts() {
        let err: TransportError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(err.to_string().starts_with("websocket error"));
    }
}
