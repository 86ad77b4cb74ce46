//! Call lifecycle records.
//!
//! A call room hosts one call, identified by the room id. The record is what
//! survives an instance restart: on startup the hub lists non-terminal records
//! and re-creates their rooms so participants can reconnect.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;

/// Key prefix for call records in the coordination store.
pub const CALL_STATE_PREFIX: &str = "call_state:";

/// Retention of a call record, whatever its status.
pub const CALL_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Retention of a record once the call has ended.
pub const ENDED_GRACE: Duration = Duration::from_secs(5 * 60);

/// Participants needed before a ringing call becomes active.
pub const ACTIVE_PARTICIPANTS: usize = 2;

/// Call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Created, waiting for a second participant
    Ringing,
    /// At least two participants joined
    Active,
    /// Finished; terminal
    Ended,
}

/// Persisted call record.
///
/// JSON layout: `{id, room_id, participant_ids, status, created_at,
/// updated_at}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallState {
    /// Call id (equal to the room id)
    pub id: Uuid,
    /// Room hosting the call
    pub room_id: Uuid,
    /// Participants, in join order, without duplicates
    pub participant_ids: Vec<Uuid>,
    /// Lifecycle status
    pub status: CallStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl CallState {
    /// New ringing call for a room with no participants.
    pub fn new(room_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: room_id,
            room_id,
            participant_ids: Vec::new(),
            status: CallStatus::Ringing,
            created_at: now,
            updated_at: now,
        }
    }

    /// Store key for a call id.
    pub fn key_for(id: Uuid) -> String {
        format!("{CALL_STATE_PREFIX}{id}")
    }

    /// Store key for this record.
    pub fn key(&self) -> String {
        Self::key_for(self.id)
    }

    /// Whether the call has ended.
    pub fn is_terminal(&self) -> bool {
        self.status == CallStatus::Ended
    }

    /// Whether `identity` is a participant.
    pub fn has_participant(&self, identity: Uuid) -> bool {
        self.participant_ids.contains(&identity)
    }

    /// How long the store should keep this record from now.
    pub fn retention(&self) -> Duration {
        if self.is_terminal() { ENDED_GRACE } else { CALL_STATE_TTL }
    }

    /// Add a participant, promoting the call to active once two distinct
    /// participants joined.
    ///
    /// Returns `true` if the record changed. Adding an existing participant
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// - `HubError::TerminalState` if the call has ended
    pub fn add_participant(&mut self, identity: Uuid, now: DateTime<Utc>) -> Result<bool, HubError> {
        if self.is_terminal() {
            return Err(HubError::TerminalState { room_id: self.room_id });
        }

        if self.has_participant(identity) {
            return Ok(false);
        }

        self.participant_ids.push(identity);
        if self.status == CallStatus::Ringing && self.participant_ids.len() >= ACTIVE_PARTICIPANTS {
            self.status = CallStatus::Active;
        }
        self.updated_at = now;
        Ok(true)
    }

    /// Remove a participant. Removing the last participant ends the call.
    ///
    /// Returns `true` if the record changed.
    pub fn remove_participant(&mut self, identity: Uuid, now: DateTime<Utc>) -> bool {
        let before = self.participant_ids.len();
        self.participant_ids.retain(|p| *p != identity);
        if self.participant_ids.len() == before {
            return false;
        }

        if self.participant_ids.is_empty() {
            self.status = CallStatus::Ended;
        }
        self.updated_at = now;
        true
    }

    /// End the call. Returns `true` if it was not already ended.
    pub fn end(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = CallStatus::Ended;
        self.updated_at = now;
        true
    }

    /// Serialize to the stored JSON form.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse the stored JSON form.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
