//! Wire-level error types.

use thiserror::Error;

/// Errors produced while encoding or decoding envelopes.
///
/// Decode failures on inbound frames are never surfaced to channel
/// consumers: the connection manager logs and drops them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The frame was not a JSON object with a string `type`.
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
    /// A payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, CoreError>;
