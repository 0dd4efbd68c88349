//! The `{type, payload}` wire unit.
//!
//! Every frame in either direction is a JSON object with a string `type`
//! and an optional `payload`. [`Envelope`] keeps the payload as raw
//! [`Value`] so each channel decides how to interpret the types it owns;
//! unknown types pass through untouched and are ignored downstream.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::{CoreError, Result};
use crate::roll::RollRequest;

/// Frame type strings.
pub mod kind {
    /// Outbound: announce readiness after connecting.
    pub const JOIN: &str = "join";
    /// Outbound: request a dice roll.
    pub const ROLL: &str = "roll";
    /// Inbound: a roll was persisted.
    pub const ROLL_CREATED: &str = "roll_created";
    /// Inbound: the server rejected a request.
    pub const ERROR: &str = "error";
    /// Inbound: server hello sent right after the upgrade.
    pub const CONNECTED: &str = "connected";
    /// Inbound: the GM issued a command.
    pub const GM_COMMAND: &str = "gm_command";
    /// Inbound: the session was closed.
    pub const SESSION_CLOSED: &str = "session_closed";
    /// Inbound: the session ended.
    pub const SESSION_ENDED: &str = "session_ended";
    /// Inbound (campaign scope): a session started.
    pub const SESSION_STARTED: &str = "session_started";
    /// Inbound (campaign scope): a closed session was resumed.
    pub const SESSION_RESUMED: &str = "session_resumed";
}

/// A single wire frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type, e.g. `roll_created`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional payload; `null` and absent are equivalent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Envelope with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
        }
    }

    /// Envelope carrying a serialized payload.
    pub fn with_payload<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(CoreError::Encode)?;
        Ok(Self {
            kind: kind.into(),
            payload: Some(payload),
        })
    }

    /// `join {ready: true}`.
    #[must_use]
    pub fn join() -> Self {
        Self {
            kind: kind::JOIN.to_owned(),
            payload: Some(json!({ "ready": true })),
        }
    }

    /// `roll <RollRequest>`.
    pub fn roll(request: &RollRequest) -> Result<Self> {
        Self::with_payload(kind::ROLL, request)
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(CoreError::Decode)
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(CoreError::Encode)
    }

    /// Payload as a JSON object, if it is one.
    #[must_use]
    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_ref().and_then(Value::as_object)
    }

    /// Deserialize the payload into a typed value.
    ///
    /// A missing payload is decoded from `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(CoreError::Decode)
    }
}
