//! Call signaling payloads.
//!
//! The server relays these without interpreting them. Only the fields it needs
//! for routing are typed; everything else is captured in `extra` and written
//! back out unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session description, never parsed by the server
    pub sdp: String,
    /// Deliver only to this participant when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    /// Unknown fields, preserved
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// ICE candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate object as produced by the client's WebRTC stack
    pub candidate: Value,
    /// Deliver only to this participant when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    /// Unknown fields, preserved
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Explicit `join` or `leave` inside a call room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallControl {
    /// Deliver only to this participant when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    /// Unknown fields, preserved
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Audio or video mute toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mute {
    /// New mute state
    pub muted: bool,
    /// Unknown fields, preserved
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
