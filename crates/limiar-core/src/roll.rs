//! Roll wire types and the bounded roll history.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_EVENTS;
use crate::ids::{CampaignId, RequestId, RollId, SessionId};

/// Who authored a roll.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleMode {
    /// Game master.
    #[serde(rename = "GM")]
    Gm,
    /// Regular player.
    #[serde(rename = "PLAYER")]
    Player,
}

/// Parsed dice term of a roll expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollDice {
    /// Number of dice.
    pub count: u32,
    /// Faces per die.
    pub sides: u32,
    /// Flat modifier added to the sum.
    pub modifier: i64,
}

/// A persisted roll, as broadcast in `roll_created` and returned by the
/// roll history endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollEvent {
    /// Dedup key.
    pub id: RollId,
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Owning session.
    pub session_id: SessionId,
    /// Display name of the author.
    pub author_name: String,
    /// Author role at roll time.
    pub role_mode: RoleMode,
    /// Optional free-text label.
    #[serde(default)]
    pub label: Option<String>,
    /// Expression as submitted, e.g. `1d20+3`.
    pub expression: String,
    /// Parsed dice term.
    pub dice: RollDice,
    /// Individual die results.
    pub results: Vec<i64>,
    /// Sum of results plus modifier.
    pub total: i64,
    /// Server timestamp (RFC 3339).
    pub created_at: String,
}

/// Outbound roll request.
///
/// `label` is always present on the wire, `null` when empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollRequest {
    /// Correlation token echoed back in `error` frames.
    pub request_id: RequestId,
    /// Trimmed label, `None` when blank.
    pub label: Option<String>,
    /// Trimmed expression.
    pub expression: String,
}

impl RollRequest {
    /// Build a request with a fresh ID, trimming both inputs.
    ///
    /// A label that is empty after trimming becomes `None`.
    #[must_use]
    pub fn new(expression: &str, label: Option<&str>) -> Self {
        let label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned);
        Self {
            request_id: RequestId::new(),
            label,
            expression: expression.trim().to_owned(),
        }
    }
}

/// The most recent roll-related failure, as seen by the consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct RollError {
    /// Request the error belongs to, when known.
    pub request_id: Option<RequestId>,
    /// Human-readable message.
    pub message: String,
}

impl RollError {
    /// Error not tied to a request.
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            request_id: None,
            message: message.into(),
        }
    }

    /// Error tied to a request.
    pub fn for_request(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// History
// ─────────────────────────────────────────────────────────────────────────────

/// Newest-first roll buffer, unique by [`RollEvent::id`], bounded at
/// [`MAX_EVENTS`].
#[derive(Clone, Debug, PartialEq)]
pub struct RollHistory {
    entries: VecDeque<RollEvent>,
    capacity: usize,
}

impl Default for RollHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl RollHistory {
    /// Empty buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }

    /// Empty buffer with a custom capacity (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether an event with this id is retained.
    #[must_use]
    pub fn contains(&self, id: &RollId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// Insert at the head. Returns `false` (and changes nothing) when the
    /// id is already present; evicts the oldest entry past capacity.
    pub fn insert(&mut self, event: RollEvent) -> bool {
        if self.contains(&event.id) {
            return false;
        }
        self.entries.push_front(event);
        self.entries.truncate(self.capacity);
        true
    }

    /// Merge a history snapshot behind the current entries.
    ///
    /// Entries already present keep their position and fields; seed entries
    /// with unseen ids are appended in the order given, up to capacity.
    /// Returns how many were added.
    pub fn seed(&mut self, snapshot: Vec<RollEvent>) -> usize {
        let mut added = 0;
        for event in snapshot {
            if self.entries.len() >= self.capacity {
                break;
            }
            if self.contains(&event.id) {
                continue;
            }
            self.entries.push_back(event);
            added += 1;
        }
        added
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest event, if any.
    #[must_use]
    pub fn head(&self) -> Option<&RollEvent> {
        self.entries.front()
    }

    /// Newest-first iterator.
    pub fn iter(&self) -> impl Iterator<Item = &RollEvent> {
        self.entries.iter()
    }

    /// Newest-first copy.
    #[must_use]
    pub fn to_vec(&self) -> Vec<RollEvent> {
        self.entries.iter().cloned().collect()
    }
}
