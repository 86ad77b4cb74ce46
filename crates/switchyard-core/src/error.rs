//! Client-facing error taxonomy.
//!
//! Every error a client can observe maps to an `error` envelope code and, when
//! it ends the session, to a WebSocket close code. Dependency failures
//! (coordination store outages) never appear here; they are absorbed by the
//! availability controller.

use switchyard_proto::{CloseCode, ErrorPayload, ProtocolError, RoomKind};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to clients by the hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Malformed, unknown, or misplaced envelope
    #[error("validation error: {0}")]
    Validation(#[from] ProtocolError),

    /// Caller is not a member of the room
    #[error("identity {identity} is not a member of room {room_id}")]
    Authorization {
        /// Room that was requested
        room_id: Uuid,
        /// Identity that was refused
        identity: Uuid,
    },

    /// The call in this room has ended
    #[error("call in room {room_id} has ended")]
    TerminalState {
        /// Room of the ended call
        room_id: Uuid,
    },

    /// An instance-wide limit was reached
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No recoverable record for a reconnect
    #[error("room not found: {room_id}")]
    RoomNotFound {
        /// Room that was requested
        room_id: Uuid,
    },

    /// The identity already has a live session in the room on this instance
    #[error("identity {identity} already connected to room {room_id}")]
    DuplicateSession {
        /// Room that was requested
        room_id: Uuid,
        /// Identity with the existing session
        identity: Uuid,
    },

    /// The room already exists with a different kind
    #[error("room {room_id} is a {existing} room, not {requested}")]
    RoomKindMismatch {
        /// Room that was requested
        room_id: Uuid,
        /// Kind of the existing room
        existing: RoomKind,
        /// Kind the caller asked for
        requested: RoomKind,
    },
}

impl HubError {
    /// Error code carried by the `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => ErrorPayload::VALIDATION,
            Self::Authorization { .. } => ErrorPayload::AUTHORIZATION,
            Self::TerminalState { .. } => ErrorPayload::TERMINAL_STATE,
            Self::ResourceExhausted(_) => ErrorPayload::RESOURCE_EXHAUSTED,
            Self::RoomNotFound { .. } => ErrorPayload::ROOM_NOT_FOUND,
            Self::DuplicateSession { .. } => ErrorPayload::DUPLICATE_SESSION,
            Self::RoomKindMismatch { .. } => ErrorPayload::ROOM_KIND_MISMATCH,
        }
    }

    /// Close code used when this error ends the session.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Validation(_) | Self::RoomKindMismatch { .. } => CloseCode::ProtocolViolation,
            Self::Authorization { .. } => CloseCode::Forbidden,
            Self::TerminalState { .. } => CloseCode::TerminalState,
            Self::ResourceExhausted(_) => CloseCode::ResourceExhausted,
            Self::RoomNotFound { .. } => CloseCode::RoomNotFound,
            Self::DuplicateSession { .. } => CloseCode::DuplicateSession,
        }
    }

    /// Error payload for the `error` envelope.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }

    /// Returns true if the same request may succeed later.
    ///
    /// Limits free up as connections leave. Everything else is a property of
    /// the request or of durable state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::DuplicateSession { .. })
    }
}
