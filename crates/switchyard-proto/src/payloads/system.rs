//! Server-emitted payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `joined`, `left` and `reconnected` envelopes.
///
/// The envelope's `sender_id` names the member; the payload reports how many
/// connections the room has on the emitting instance afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCount {
    /// Local member count after the change
    pub member_count: usize,
}

/// Error payload for `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ErrorPayload {
    /// Malformed, unknown, or misplaced envelope.
    pub const VALIDATION: &'static str = "validation_error";
    /// Caller is not allowed in the room.
    pub const AUTHORIZATION: &'static str = "authorization_error";
    /// Missing or invalid bearer token.
    pub const UNAUTHENTICATED: &'static str = "unauthenticated";
    /// The call has already ended.
    pub const TERMINAL_STATE: &'static str = "terminal_state";
    /// An instance limit was reached.
    pub const RESOURCE_EXHAUSTED: &'static str = "resource_exhausted";
    /// No recoverable record for the room.
    pub const ROOM_NOT_FOUND: &'static str = "room_not_found";
    /// The identity already has a session in the room on this instance.
    pub const DUPLICATE_SESSION: &'static str = "duplicate_session";
    /// The room exists with a different kind.
    pub const ROOM_KIND_MISMATCH: &'static str = "room_kind_mismatch";

    /// Create an error payload with an arbitrary code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Self::VALIDATION, message)
    }

    /// Create an authorization error.
    pub fn authorization(room_id: Uuid) -> Self {
        Self::new(Self::AUTHORIZATION, format!("not a member of room {room_id}"))
    }

    /// Create an authentication error.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Self::UNAUTHENTICATED, message)
    }

    /// Create a terminal state error.
    pub fn terminal_state(room_id: Uuid) -> Self {
        Self::new(Self::TERMINAL_STATE, format!("call in room {room_id} has ended"))
    }

    /// Create a room not found error.
    pub fn room_not_found(room_id: Uuid) -> Self {
        Self::new(Self::ROOM_NOT_FOUND, format!("room not found: {room_id}"))
    }
}
