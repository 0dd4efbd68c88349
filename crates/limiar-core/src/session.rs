//! Session-scoped payloads: GM commands, campaign lifecycle events and the
//! REST session summary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::kind;
use crate::ids::{CampaignId, SessionId};

/// Commands a GM can push to players.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCommandKind {
    /// Open the shop for purchases.
    OpenShop,
    /// Close the shop.
    CloseShop,
    /// Ask players to roll.
    RequestRoll,
}

impl SessionCommandKind {
    /// Wire string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenShop => "open_shop",
            Self::CloseShop => "close_shop",
            Self::RequestRoll => "request_roll",
        }
    }
}

impl std::fmt::Display for SessionCommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionCommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_shop" => Ok(Self::OpenShop),
            "close_shop" => Ok(Self::CloseShop),
            "request_roll" => Ok(Self::RequestRoll),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

/// Payload of a `gm_command` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCommand {
    /// Which command.
    pub command: SessionCommandKind,
    /// Command-specific data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Issuer display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    /// Issue timestamp (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
}

/// Campaign-scope lifecycle notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignEventKind {
    /// A session started.
    SessionStarted,
    /// A session was closed.
    SessionClosed,
    /// A closed session was resumed.
    SessionResumed,
}

impl CampaignEventKind {
    /// Map a frame type to a lifecycle kind; other types yield `None`.
    #[must_use]
    pub fn from_frame(frame_kind: &str) -> Option<Self> {
        match frame_kind {
            kind::SESSION_STARTED => Some(Self::SessionStarted),
            kind::SESSION_CLOSED => Some(Self::SessionClosed),
            kind::SESSION_RESUMED => Some(Self::SessionResumed),
            _ => None,
        }
    }
}

/// A campaign lifecycle event with its raw payload object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: CampaignEventKind,
    /// Payload object; `{}` when the frame had none.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl CampaignEvent {
    /// Session id named in the payload, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.payload
            .get("sessionId")
            .and_then(Value::as_str)
            .map(SessionId::from)
    }
}

/// Lifecycle status of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepting rolls.
    Active,
    /// Ended.
    Closed,
}

/// Session record returned by the REST API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub id: SessionId,
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Sequence number within the campaign.
    pub number: u32,
    /// Optional title.
    #[serde(default)]
    pub title: Option<String>,
    /// Code players use to join.
    #[serde(default)]
    pub join_code: Option<String>,
    /// Status.
    pub status: SessionStatus,
    /// Whether this is the campaign's active session.
    #[serde(default)]
    pub is_active: bool,
    /// Start timestamp.
    #[serde(default)]
    pub started_at: Option<String>,
    /// End timestamp.
    #[serde(default)]
    pub ended_at: Option<String>,
    /// Accumulated duration.
    #[serde(default)]
    pub duration_seconds: u64,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    #[serde(default)]
    pub updated_at: Option<String>,
}
